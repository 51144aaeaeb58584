use std::process;

#[tokio::main]
async fn main() {
    match watch::cli::run().await {
        Ok(reason) => process::exit(reason.exit_code()),
        Err(e) => {
            eprintln!("Command failed with: {}", e);
            process::exit(1)
        }
    }
}
