use crate::protocol::SetupMessage;
use crate::session::SessionSettings;

#[derive(Debug, Clone)]
pub struct Config {
    // 应用信息
    pub app_name: &'static str,
    pub app_version: &'static str,

    // 网络配置（静态部分）
    pub ws_url: &'static str,
    pub model: &'static str,
    pub api_key_env: &'static str,

    // 语音配置
    pub voice_name: &'static str,

    // 音频配置
    pub capture_device: &'static str,
    pub playback_device: &'static str,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
    pub playback_period_size: usize,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let config = Self {
            app_name: env!("APP_NAME"),
            app_version: env!("APP_VERSION"),

            ws_url: env!("WS_URL"),
            model: env!("LIVE_MODEL"),
            api_key_env: env!("API_KEY_ENV"),

            voice_name: env!("VOICE_NAME"),

            capture_device: env!("CAPTURE_DEVICE"),
            playback_device: env!("PLAYBACK_DEVICE"),
            input_sample_rate: env!("INPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse INPUT_SAMPLE_RATE")?,
            output_sample_rate: env!("OUTPUT_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse OUTPUT_SAMPLE_RATE")?,
            frame_size: env!("FRAME_SIZE").parse()
                .map_err(|_| "Failed to parse FRAME_SIZE")?,
            playback_period_size: env!("PLAYBACK_PERIOD_SIZE").parse()
                .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
        };

        // 输入输出必须是两个独立的采样率上下文
        if config.input_sample_rate == 0 || config.output_sample_rate == 0 {
            return Err("Sample rates must be positive");
        }
        if config.frame_size == 0 {
            return Err("FRAME_SIZE must be positive");
        }
        Ok(config)
    }

    /// 运行时从环境变量读取 API Key
    pub fn api_key(&self) -> anyhow::Result<String> {
        match std::env::var(self.api_key_env) {
            Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
            _ => anyhow::bail!("Environment variable {} is not set", self.api_key_env),
        }
    }

    pub fn setup_message(&self) -> SetupMessage {
        SetupMessage::audio(self.model, self.voice_name)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            setup: self.setup_message(),
            input_sample_rate: self.input_sample_rate,
            output_sample_rate: self.output_sample_rate,
            frame_size: self.frame_size,
        }
    }
}
