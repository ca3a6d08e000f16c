mod ai;
mod app;
mod binding;
mod guard;
mod outbound;
mod phone;
mod signature;
mod store;
mod templates;
mod types;

#[tokio::main]
async fn main() {
    app::run().await;
}
