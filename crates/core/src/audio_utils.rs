use base64::Engine;

/// ElevenLabs agents exchange 16 kHz mono PCM16 in both directions.
pub const AGENT_PCM16_SAMPLE_RATE: f64 = 16000.0;

/// Converts a slice of f32 samples to a vector of i16 samples.
pub fn convert_f32_to_i16(pcm32: &[f32]) -> Vec<i16> {
    pcm32
        .iter()
        .map(|&sample| (sample * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16)
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Averages interleaved frames down to a single channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Root-mean-square level of a PCM16 chunk, normalized to `0.0..=1.0`.
pub fn rms_level(pcm16: &[i16]) -> f32 {
    if pcm16.is_empty() {
        return 0.0;
    }
    let sum: f64 = pcm16
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    ((sum / pcm16.len() as f64).sqrt() as f32).clamp(0.0, 1.0)
}

pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

pub fn decode_i16(base64_fragment: &str) -> Vec<i16> {
    if let Ok(pcm16_bytes) = base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect()
    } else {
        tracing::error!("Failed to decode base64 fragment to i16");
        Vec::new()
    }
}
