use std::{sync::Arc, time::Duration};

use apiclient::{
    ApiClient, BearerAuthorizer, ClientOptions, HeaderLimiter, LimiterConfig, Request,
    RECOVERABLE_STATUSES,
};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
    stargazers_count: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base =
        std::env::var("API_BASE_URL").unwrap_or_else(|_| "https://api.github.com/".to_owned());

    let mut client = ApiClient::with_config(
        ClientOptions::default()
            .with_base_url(base)
            .with_retry_status(RECOVERABLE_STATUSES)
            .with_retry_delay(Duration::from_secs(2))
            .with_header(reqwest::header::USER_AGENT, "apiclient-demo".parse()?),
    )?
    .with_rate_limiter(Arc::new(HeaderLimiter::new(LimiterConfig::default())));

    if let Ok(token) = std::env::var("API_TOKEN") {
        client = client.with_authorizer(BearerAuthorizer::new(token));
    }

    let repo: Repository = client.get("repos/rust-lang/rust").await?;
    println!("{} has {} stars", repo.full_name, repo.stargazers_count);

    match client.execute(Request::get("repos/rust-lang/no-such-repo")).await {
        Ok(response) => println!("unexpected: {}", response.status()),
        Err(err) => println!("cause: {:?}, error: {}", err.cause(), err),
    }

    Ok(())
}
