use anyhow::{Context, Result};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};
use tracing::{error, info, warn};

use open_jukebox::{
    audio::{pipeline::SymphoniaTranscoder, player::AudioPlayer, session::PlaybackState},
    config::Config,
    sources::{SourceManager, SourceResolver},
    voice::UdpConnector,
};

const USAGE: &str = "\
Uso:
  open-jukebox --health-check
  open-jukebox resolve <consulta>
  open-jukebox play <consulta o URL>...";

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_jukebox=debug".parse()?)
                .add_directive("symphonia=warn".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Jukebox v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads.max(1))
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let http = reqwest::Client::builder()
        .user_agent(concat!("open-jukebox/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let sources = Arc::new(SourceManager::new(&config, http));

    match args.first().map(String::as_str) {
        Some("--health-check") => health_check(&sources).await,
        Some("resolve") if args.len() > 1 => resolve(&sources, &args[1..].join(" ")).await,
        Some("play") if args.len() > 1 => play(config, sources, &args[1..]).await,
        _ => {
            println!("{}", USAGE);
            Ok(())
        }
    }
}

async fn health_check(sources: &SourceManager) -> Result<()> {
    sources.verify_dependencies().await?;
    println!("OK");
    Ok(())
}

async fn resolve(sources: &SourceManager, query: &str) -> Result<()> {
    let tracks = sources.resolve(query, UserId::new(1)).await?;
    for (i, track) in tracks.iter().enumerate() {
        let duration = track
            .duration()
            .map(|d| humantime::format_duration(d).to_string())
            .unwrap_or_else(|| "?".to_string());
        println!("{:>3}. {} [{}] {}", i + 1, track.title(), duration, track.url());
    }
    Ok(())
}

/// Reproduce las consultas en orden contra `VOICE_ENDPOINT` hasta vaciar la cola.
async fn play(config: Config, sources: Arc<SourceManager>, queries: &[String]) -> Result<()> {
    let endpoint = config
        .voice_endpoint
        .clone()
        .context("VOICE_ENDPOINT no configurado")?;

    let config = Arc::new(config);
    let transcoder = Arc::new(SymphoniaTranscoder::from_config(&config));
    let (player, mut notifications) = AudioPlayer::new(
        config.clone(),
        Arc::new(UdpConnector::new(endpoint)),
        transcoder,
        sources.clone(),
    );
    let player = Arc::new(player.with_cache(sources.cache()));
    let maintenance = player.spawn_maintenance();

    let guild = GuildId::new(1);
    player.join(guild, ChannelId::new(1)).await?;

    for query in queries {
        match player.play(guild, query, UserId::new(1)).await {
            Ok(added) => info!("➕ {} track(s) para '{}'", added.len(), query),
            Err(e) => warn!("⚠️ No se pudo agregar '{}': {}", query, e),
        }
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            Some(notification) = notifications.recv() => {
                match serde_json::to_string(&notification) {
                    Ok(json) => info!("📨 {}", json),
                    Err(e) => error!("Error serializando notificación: {}", e),
                }
            }
            _ = ticker.tick() => {
                let idle = player.state(guild).map_or(true, |s| s == PlaybackState::Idle);
                let connected = player.session(guild).is_ok_and(|s| s.is_connected());
                if idle && (player.list_queue(guild).is_empty() || !connected) {
                    info!("✅ Reproducción terminada");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("⚠️ Señal de shutdown recibida, cerrando...");
                break;
            }
        }
    }

    let _ = player.leave(guild).await;
    maintenance.abort();
    Ok(())
}
