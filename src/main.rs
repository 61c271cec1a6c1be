use color_eyre::Result;
use dndclient::config::AppConfig;
use dndclient::console::Console;
use dndclient::mqtt::SessionManager;
use tokio::io::BufReader;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = AppConfig::default_path()?;
    AppConfig::ensure_default(&config_path).await?;
    let config = AppConfig::load(&config_path).await?;
    info!(
        "Using broker {}:{} from {}",
        config.mqtt.host,
        config.mqtt.port,
        config_path.display()
    );

    let identity = config.resolved_identity();
    let mut manager = SessionManager::new(config.mqtt.clone());

    if let Some(identity) = &identity {
        match manager.login(identity, identity.register_self).await {
            Ok(session) => info!("Logged in as {}", session.user_id()),
            Err(e) => error!("Automatic login failed: {}", e),
        }
    }

    Console::new(manager, identity)
        .run(BufReader::new(tokio::io::stdin()))
        .await?;

    info!("Goodbye");
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    let level = std::env::var("RUST_LOG")
        .ok()
        .and_then(|level| level.parse::<Level>().ok())
        .unwrap_or(Level::INFO);

    FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}
