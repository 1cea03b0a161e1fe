use std::{env, fs, path, time::Instant};

use dotenv::dotenv;
use mcdash::{
    config::Config,
    status::{UnifiedStatus, poll},
    terminal_colors::*,
    tracing::init_tracing,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    let args = env::args().collect::<Box<[String]>>();

    // first command line argument is the location of the config file
    let config_file = args.get(1).cloned().unwrap_or("config.toml".to_string());

    let config_file_path = path::Path::new(&config_file).canonicalize()?;
    println!(
        "parsing config at {}",
        config_file_path.as_os_str().to_string_lossy()
    );
    let config: Config = toml::from_str(&fs::read_to_string(config_file_path)?)?;

    init_tracing(&config);
    info!("Logging initialized");

    let endpoint = config.endpoint();
    info!(
        "polling {endpoint} every {}s (query {}, latency {})",
        config.poll_interval().as_secs(),
        if config.query.enabled { "on" } else { "off" },
        if config.latency.enabled { "on" } else { "off" },
    );

    loop {
        let start_time = Instant::now();
        let unified = poll(&config).await;

        match serde_json::to_string(&unified) {
            Ok(json) => println!("{json}"),
            Err(err) => warn!("couldn't serialize status: {err}"),
        }
        print_summary(&unified, start_time.elapsed().as_secs_f64());

        if config.exit_on_done {
            break;
        }
        tokio::time::sleep(config.poll_interval()).await;
    }

    Ok(())
}

fn print_summary(unified: &UnifiedStatus, elapsed_secs: f64) {
    let Some(status) = unified.status.as_ref().filter(|_| unified.online) else {
        println!(
            "{RED}offline{RESET} after {BOLD}{elapsed_secs:.2}{RESET} seconds: {}",
            unified.error.as_deref().unwrap_or("unknown error")
        );
        return;
    };

    let version = status.version_name.as_deref().unwrap_or("unknown version");
    let latency = match &unified.latency {
        Some(latency) => format!(
            "{BOLD}{}ms{RESET} {GRAY}({}, {:?}){RESET}",
            latency.value_ms, latency.method, latency.confidence_level
        ),
        None => format!("{GRAY}unavailable{RESET}"),
    };
    println!(
        "{GREEN}online{RESET} after {BOLD}{elapsed_secs:.2}{RESET} seconds ({BLUE}{version}{RESET}, {YELLOW}{BOLD}{}{RESET}{YELLOW}/{}{RESET} players, status ping {BOLD}{}ms{RESET}, latency {latency})",
        status.players_online.unwrap_or_default(),
        status.players_max.unwrap_or_default(),
        unified.status_latency_ms.unwrap_or_default(),
    );
}
