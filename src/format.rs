//! Stream format and render time types.

use core::fmt;

/// Sample representation carried by a [`Format`].
///
/// Buffers in this crate always hold `f32` samples; the representation
/// describes what the device or stream on the other side of a connection
/// speaks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum PcmFormat {
    Float32,
    Float64,
    /// Signed 8.24 fixed point
    Fixed824,
    Int16,
}

impl PcmFormat {
    /// Size of one sample in bytes on the wire.
    pub fn sample_byte_count(self) -> usize {
        match self {
            PcmFormat::Float32 | PcmFormat::Fixed824 => 4,
            PcmFormat::Float64 => 8,
            PcmFormat::Int16 => 2,
        }
    }
}

impl fmt::Display for PcmFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PcmFormat::Float32 => "float32",
            PcmFormat::Float64 => "float64",
            PcmFormat::Fixed824 => "fixed824",
            PcmFormat::Int16 => "int16",
        };
        f.write_str(name)
    }
}

/// Immutable description of an audio stream.
///
/// Two formats are equal when every field is equal. Every [`Connection`](crate::Connection)
/// carries exactly one.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Format {
    sample_rate: f64,
    channel_count: u32,
    pcm_format: PcmFormat,
    interleaved: bool,
}

impl Format {
    pub fn new(sample_rate: f64, channel_count: u32, pcm_format: PcmFormat, interleaved: bool) -> Self {
        Self {
            sample_rate,
            channel_count,
            pcm_format,
            interleaved,
        }
    }

    /// Non-interleaved float32, the layout nodes render in by default.
    pub fn float32(sample_rate: f64, channel_count: u32) -> Self {
        Self::new(sample_rate, channel_count, PcmFormat::Float32, false)
    }

    #[inline]
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    #[inline]
    pub fn channel_count(&self) -> u32 {
        self.channel_count
    }

    #[inline]
    pub fn pcm_format(&self) -> PcmFormat {
        self.pcm_format
    }

    #[inline]
    pub fn is_interleaved(&self) -> bool {
        self.interleaved
    }

    /// Number of separate sample runs a buffer of this format holds.
    pub fn buffer_count(&self) -> u32 {
        if self.interleaved {
            1
        } else {
            self.channel_count
        }
    }

    /// Number of channels packed into each run.
    pub fn stride(&self) -> u32 {
        if self.interleaved {
            self.channel_count
        } else {
            1
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} ch, {}, {}",
            self.sample_rate,
            self.channel_count,
            self.pcm_format,
            if self.interleaved { "interleaved" } else { "non-interleaved" }
        )
    }
}

/// Position of a render callback on the device timeline.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct AudioTime {
    pub sample_time: i64,
    pub sample_rate: f64,
}

impl AudioTime {
    pub fn new(sample_time: i64, sample_rate: f64) -> Self {
        Self {
            sample_time,
            sample_rate,
        }
    }

    /// Time advanced by `frames` samples at the same rate.
    pub fn offset_by(&self, frames: i64) -> Self {
        Self {
            sample_time: self.sample_time + frames,
            sample_rate: self.sample_rate,
        }
    }

    pub fn seconds(&self) -> f64 {
        if self.sample_rate > 0.0 {
            self.sample_time as f64 / self.sample_rate
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_compare_structurally() {
        let a = Format::float32(48000.0, 2);
        let b = Format::new(48000.0, 2, PcmFormat::Float32, false);
        assert_eq!(a, b);
        assert_ne!(a, Format::float32(44100.0, 2));
        assert_ne!(a, Format::new(48000.0, 2, PcmFormat::Float32, true));
    }

    #[test]
    fn interleaved_layout() {
        let f = Format::new(44100.0, 2, PcmFormat::Int16, true);
        assert_eq!(f.buffer_count(), 1);
        assert_eq!(f.stride(), 2);

        let f = Format::float32(44100.0, 2);
        assert_eq!(f.buffer_count(), 2);
        assert_eq!(f.stride(), 1);
    }

    #[test]
    fn time_in_seconds() {
        let t = AudioTime::new(96000, 48000.0);
        assert_eq!(t.seconds(), 2.0);
        assert_eq!(t.offset_by(48000).seconds(), 3.0);
    }
}
