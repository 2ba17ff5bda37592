use std::time::Duration;

use apiclient::{
    multiplex::{self, Mux, MuxOptions, UrlRequestProducer},
    ApiClient, CancellationToken, ClientOptions, RECOVERABLE_STATUSES,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let base = std::env::var("API_BASE_URL")
        .unwrap_or_else(|_| "https://jsonplaceholder.typicode.com/".to_owned());

    let client = ApiClient::with_config(
        ClientOptions::default()
            .with_base_url(base)
            .with_retry_status(RECOVERABLE_STATUSES)
            .with_retry_delay(Duration::from_secs(1)),
    )?;
    let mux = Mux::new(client, 8);

    let urls = (1..=40).map(|id| format!("todos/{id}"));
    let iter = mux.run(
        &CancellationToken::new(),
        UrlRequestProducer::get(urls),
        MuxOptions::default(),
    );

    let todos: Vec<serde_json::Value> = multiplex::unmarshal(iter).await?;
    for todo in &todos {
        println!("{} {}", todo["id"], todo["title"]);
    }

    Ok(())
}
