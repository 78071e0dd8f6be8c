#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    gurukul_lib::run().await
}
