//! Webhook Worker Service - Entry Point
//!
//! Background worker that drains queued webhook jobs.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    webhook_worker::run().await
}
