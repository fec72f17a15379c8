//! Notifications Worker Service - Entry Point
//!
//! Delivery engine, periodic sweeps and the admin HTTP server.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    zerg_notifications_worker::run().await
}
