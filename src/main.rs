mod audio;
mod config;
mod net_link;
mod protocol;
mod session;

use std::io::Write;
use std::time::Duration;

use audio::{AlsaBackend, AudioConfig};
use config::Config;
use net_link::WsTransport;
use session::LiveSession;
use tokio::signal;
use tokio::sync::oneshot;

const METER_WIDTH: usize = 40;

/// 把 RMS 音量画成一条终端进度条
fn render_meter(level: f32) -> String {
    // 语音 RMS 一般不超过 0.3，放大后再截断
    let filled = ((level * 3.0).clamp(0.0, 1.0) * METER_WIDTH as f32).round() as usize;
    format!(
        "\r[{}{}] {:.3}",
        "#".repeat(filled),
        " ".repeat(METER_WIDTH - filled),
        level
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志，默认 info
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // 加载配置
    let config = Config::new().map_err(anyhow::Error::msg)?;
    let api_key = config.api_key()?;
    log::info!("{} v{} starting, model {}", config.app_name, config.app_version, config.model);

    let backend = AlsaBackend::new(AudioConfig::from(&config));
    let transport = WsTransport::new(config.ws_url, api_key);
    let session = LiveSession::new(backend, transport, config.session_settings(), |level| {
        let mut stderr = std::io::stderr();
        let _ = write!(stderr, "{}", render_meter(level));
        let _ = stderr.flush();
    });

    // 会话关闭（本地或远端）时通知主循环
    let (tx_closed, mut rx_closed) = oneshot::channel::<()>();
    session
        .connect(move || {
            let _ = tx_closed.send(());
        })
        .await?;
    log::info!("Connected. Speak into the microphone, Ctrl+C to quit.");

    tokio::select! {
        _ = signal::ctrl_c() => {
            eprintln!();
            log::info!("Received Ctrl+C, shutting down...");
            session.disconnect();
            if tokio::time::timeout(Duration::from_secs(2), &mut rx_closed).await.is_err() {
                log::warn!("Server did not acknowledge close in time");
            }
        }
        _ = &mut rx_closed => {
            eprintln!();
            log::info!("Session ended by server");
        }
    }

    Ok(())
}
