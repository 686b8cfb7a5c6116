pub mod alsa;
pub mod netaudio;
pub mod waveout;
