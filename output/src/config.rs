use serde::Deserialize;
use std::path::PathBuf;

pub const SOUND_CARD_ENV: &str = "TIMIDITY_SOUND_CARD";
pub const PCM_DEVICE_ENV: &str = "TIMIDITY_PCM_DEVICE";
pub const PCM_NAME_ENV: &str = "TIMIDITY_PCM_NAME";
pub const SPEAKER_ENV: &str = "SPEAKER";
pub const ALSA_DEBUG_ENV: &str = "PLAYMODE_ALSA_DEBUG";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for auto-split output files; next to the input when unset.
    pub output_dir: Option<PathBuf>,
    /// Use the whole input path, separators replaced, as the output name.
    pub flatten_auto_names: bool,
    pub alsa: AlsaConfig,
    pub waveout: WaveOutConfig,
    pub flac: FlacConfig,
    pub vorbis: VorbisConfig,
    pub speex: SpeexConfig,
    pub netaudio: NetAudioConfig,
    pub aiff: AiffConfig,
    pub buffer: BufferConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlsaConfig {
    pub device: String,
    pub period_frames: Option<u32>,
    pub periods: Option<u32>,
    /// Poll timeout while the device has no room, in milliseconds.
    pub wait_ms: u32,
}

impl Default for AlsaConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            period_frames: None,
            periods: None,
            wait_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WaveOutConfig {
    /// Device index; `None` selects the wave mapper.
    pub device_id: Option<u32>,
    pub buffers: usize,
    pub buffer_bytes: usize,
    pub sleep_ms: u64,
}

impl Default for WaveOutConfig {
    fn default() -> Self {
        Self {
            device_id: None,
            buffers: 32,
            buffer_bytes: 4096,
            sleep_ms: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlacConfig {
    pub block_size: usize,
}

impl Default for FlacConfig {
    fn default() -> Self {
        Self { block_size: 4096 }
    }
}

/// Ogg-Vorbis rate control. `quality` takes precedence over `bitrate`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VorbisConfig {
    /// VBR quality in -0.1 ..= 1.0.
    pub quality: Option<f32>,
    /// Nominal bitrate in bits per second.
    pub bitrate: Option<u32>,
}

impl Default for VorbisConfig {
    fn default() -> Self {
        Self {
            quality: Some(0.4),
            bitrate: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeexConfig {
    pub quality: i32,
    pub complexity: i32,
    pub vbr: bool,
    pub frames_per_packet: usize,
}

impl Default for SpeexConfig {
    fn default() -> Self {
        Self {
            quality: 8,
            complexity: 3,
            vbr: false,
            frames_per_packet: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    #[default]
    Internal,
    External,
}

impl Speaker {
    pub fn parse(value: &str) -> Option<Speaker> {
        match value.trim().to_ascii_lowercase().as_str() {
            "i" | "internal" => Some(Speaker::Internal),
            "e" | "external" => Some(Speaker::External),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Speaker::Internal => "internal",
            Speaker::External => "external",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetAudioConfig {
    pub server: String,
    pub speaker: Speaker,
}

impl Default for NetAudioConfig {
    fn default() -> Self {
        Self {
            server: "localhost:7070".to_string(),
            speaker: Speaker::Internal,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiffConfig {
    /// Bytes between header rewrites while streaming.
    pub patch_interval: usize,
}

impl Default for AiffConfig {
    fn default() -> Self {
        Self {
            patch_interval: 128 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 1 << 16 }
    }
}

impl OutputConfig {
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlays the legacy device-selection variables read through `lookup`.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let card = lookup(SOUND_CARD_ENV).and_then(|v| v.trim().parse::<u32>().ok());
        let device = lookup(PCM_DEVICE_ENV).and_then(|v| v.trim().parse::<u32>().ok());
        if card.is_some() || device.is_some() {
            self.alsa.device = format!("hw:{},{}", card.unwrap_or(0), device.unwrap_or(0));
        }
        if let Some(name) = lookup(PCM_NAME_ENV).filter(|v| !v.trim().is_empty()) {
            self.alsa.device = name.trim().to_string();
        }
        if let Some(speaker) = lookup(SPEAKER_ENV).and_then(|v| Speaker::parse(&v)) {
            self.netaudio.speaker = speaker;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn card_and_device_build_hw_name() {
        let mut config = OutputConfig::default();
        config.apply_env_from(lookup(&[(SOUND_CARD_ENV, "1"), (PCM_DEVICE_ENV, "3")]));
        assert_eq!(config.alsa.device, "hw:1,3");
    }

    #[test]
    fn pcm_name_wins_over_card() {
        let mut config = OutputConfig::default();
        config.apply_env_from(lookup(&[(SOUND_CARD_ENV, "1"), (PCM_NAME_ENV, "plughw:2")]));
        assert_eq!(config.alsa.device, "plughw:2");
    }

    #[test]
    fn speaker_selection() {
        let mut config = OutputConfig::default();
        config.apply_env_from(lookup(&[(SPEAKER_ENV, "E")]));
        assert_eq!(config.netaudio.speaker, Speaker::External);
        config.apply_env_from(lookup(&[(SPEAKER_ENV, "bogus")]));
        assert_eq!(config.netaudio.speaker, Speaker::External);
    }

    #[test]
    fn defaults_without_env() {
        let mut config = OutputConfig::default();
        config.apply_env_from(lookup(&[]));
        assert_eq!(config.alsa.device, "default");
        assert_eq!(config.vorbis.quality, Some(0.4));
        assert_eq!(config.aiff.patch_interval, 128 * 1024);
    }
}
