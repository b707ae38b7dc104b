//! Audio boundary: capture/playback devices and codecs are external
//! collaborators, specified here only as capability-set traits. The core
//! never talks to hardware or a compression library directly.

/// One captured frame of 16-bit linear PCM samples.
pub trait AudioSource: Send {
    fn capture_frame(&mut self) -> Option<Vec<i16>>;
}

/// One frame of 16-bit linear PCM samples ready for playback.
pub trait AudioSink: Send {
    fn play_frame(&mut self, samples: &[i16]);
}

/// Capability set a codec exposes. A profiling wrapper can implement this
/// trait too, delegating to an inner `Codec` plus its own bookkeeping, and
/// compose with any other implementation.
pub trait Codec: Send + Sync {
    fn configure(&mut self, sample_rate: u32, channels: u16) -> bool;
    fn process_input(&mut self, samples: &[i16]) -> Vec<u8>;
    fn process_output(&mut self, payload: &[u8]) -> Vec<i16>;
    fn cleanup(&mut self);
    fn supported_formats(&self) -> &'static [&'static str];
    fn supported_rates(&self) -> &'static [u32];
    fn supported_buffer_sizes(&self) -> &'static [usize];
    fn payload_type(&self) -> u8;
    fn silence_frame(&self) -> Vec<u8>;
}

const PT_PCMU: u8 = 0;
const SAMPLES_PER_PACKET: usize = 160;

fn linear_to_ulaw(sample: i16) -> u8 {
    const BIAS: i16 = 0x84;
    const CLIP: i16 = 32635;

    let sign: i16;
    let mut mag: i16;
    if sample < 0 {
        mag = if sample == i16::MIN { CLIP } else { -sample };
        sign = 0x80;
    } else {
        mag = sample;
        sign = 0;
    }
    if mag > CLIP {
        mag = CLIP;
    }
    mag += BIAS;

    let mut exponent: u8 = 7;
    let mut exp_mask: i16 = 0x4000;
    while exponent > 0 && (mag & exp_mask) == 0 {
        exponent -= 1;
        exp_mask >>= 1;
    }
    let mantissa = ((mag >> (exponent as i16 + 3)) & 0x0F) as u8;
    !((sign as u8) | (exponent << 4) | mantissa)
}

fn ulaw_to_linear(sample: u8) -> i16 {
    let ulaw = !sample;
    let sign = (ulaw & 0x80) != 0;
    let exponent = ((ulaw >> 4) & 0x07) as u32;
    let mantissa = (ulaw & 0x0F) as i32;
    let biased = ((mantissa | 0x10) << (exponent + 3)) + (1i32 << (exponent + 2));
    let mag = (biased - 132).max(0);
    if sign {
        -(mag as i16)
    } else {
        mag as i16
    }
}

/// A minimal G.711 mu-law codec used as the default test double for the
/// sender/jitter/listener paths. Not a production encoder (no VAD, no
/// comfort noise) — just enough to exercise payload plumbing end-to-end.
#[derive(Debug, Default)]
pub struct PcmuNullCodec;

impl Codec for PcmuNullCodec {
    fn configure(&mut self, sample_rate: u32, channels: u16) -> bool {
        sample_rate == 8000 && channels == 1
    }

    fn process_input(&mut self, samples: &[i16]) -> Vec<u8> {
        samples.iter().map(|&s| linear_to_ulaw(s)).collect()
    }

    fn process_output(&mut self, payload: &[u8]) -> Vec<i16> {
        payload.iter().map(|&b| ulaw_to_linear(b)).collect()
    }

    fn cleanup(&mut self) {}

    fn supported_formats(&self) -> &'static [&'static str] {
        &["pcm_s16le"]
    }

    fn supported_rates(&self) -> &'static [u32] {
        &[8000]
    }

    fn supported_buffer_sizes(&self) -> &'static [usize] {
        &[SAMPLES_PER_PACKET]
    }

    fn payload_type(&self) -> u8 {
        PT_PCMU
    }

    fn silence_frame(&self) -> Vec<u8> {
        vec![0xFF; SAMPLES_PER_PACKET]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulaw_roundtrip_near_zero() {
        let encoded = linear_to_ulaw(0);
        let decoded = ulaw_to_linear(encoded);
        assert!(decoded.abs() < 50);
    }

    #[test]
    fn codec_reports_pcmu_payload_type() {
        let codec = PcmuNullCodec;
        assert_eq!(codec.payload_type(), PT_PCMU);
        assert_eq!(codec.silence_frame().len(), SAMPLES_PER_PACKET);
    }

    #[test]
    fn configure_rejects_unsupported_rate() {
        let mut codec = PcmuNullCodec;
        assert!(!codec.configure(16000, 1));
        assert!(codec.configure(8000, 1));
    }

    #[test]
    fn process_input_output_roundtrip_shape() {
        let mut codec = PcmuNullCodec;
        let samples = vec![0i16; SAMPLES_PER_PACKET];
        let encoded = codec.process_input(&samples);
        assert_eq!(encoded.len(), SAMPLES_PER_PACKET);
        let decoded = codec.process_output(&encoded);
        assert_eq!(decoded.len(), SAMPLES_PER_PACKET);
    }
}
