use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "chain-cli")]
#[command(about = "CLI client for the credit ledger node")]
struct Cli {
    /// Node base URL (e.g. http://127.0.0.1:8080)
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit a batch of transaction records as a JSON array of objects
    Submit {
        /// e.g. '[{"type":"user_registration","username":"alice"}]'
        #[arg(long)]
        records: String,
    },
    /// Chain summary: total blocks and latest block
    Stats,
    /// Full chain, ascending index
    Blocks,
    /// Flattened transaction list, most recent block first
    Transactions,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.cmd {
        Command::Submit { records } => {
            let records: serde_json::Value = serde_json::from_str(&records)?;
            if !records.is_array() {
                bail!("--records must be a JSON array of objects");
            }
            let res = client
                .post(format!("{}/transactions", cli.node))
                .json(&records)
                .send()
                .await?;
            let status = res.status();
            let body: serde_json::Value = res.json().await?;
            println!("status: {}", status);
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        Command::Stats => print_get(&client, &cli.node, "stats").await?,
        Command::Blocks => print_get(&client, &cli.node, "blocks").await?,
        Command::Transactions => print_get(&client, &cli.node, "transactions").await?,
    }
    Ok(())
}

async fn print_get(client: &reqwest::Client, node: &str, path: &str) -> Result<()> {
    let res = client.get(format!("{node}/{path}")).send().await?;
    let body: serde_json::Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
