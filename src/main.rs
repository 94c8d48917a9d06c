use clap::Parser;

#[derive(Parser)]
#[command(name = "discord-relay", about = "Discord-to-backend relay server.")]
struct Args {
    /// Path to the relay config YAML (falls back to RELAY_CONFIG, then ./config.yaml).
    #[arg(long, env = "RELAY_CONFIG")]
    config: Option<String>,
}

#[rocket::main]
async fn main() {
    let args = Args::parse();

    let rocket = match discord_relay::rocket_from_config_path(args.config.as_deref()) {
        Ok(rocket) => rocket,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = rocket.launch().await {
        eprintln!("Server failed: {e}");
        std::process::exit(1);
    }
}
