mod cmd;

use clap::Parser;
use vigil::init_logs;

#[tokio::main]
async fn main() {
    init_logs();
    cmd::Args::parse().run().await;
}
