//! Sample buffers handed through the graph during rendering.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use std::sync::OnceLock;

use crate::error::BufferError;
use crate::format::Format;

/// A block of `f32` samples laid out as its [`Format`] describes.
///
/// Non-interleaved formats hold one run per channel; interleaved formats hold a
/// single run of `frame_length * channel_count` samples. Storage is allocated
/// once for `frame_capacity` frames; [`set_frame_length`](Self::set_frame_length)
/// only moves the logical end.
#[derive(Clone, Debug)]
pub struct PcmBuffer {
    format: Format,
    frame_capacity: u32,
    frame_length: u32,
    data: Vec<f32>,
}

impl PcmBuffer {
    pub fn new(format: Format, frame_capacity: u32) -> Self {
        let len = frame_capacity as usize * format.channel_count() as usize;
        Self {
            format,
            frame_capacity,
            frame_length: frame_capacity,
            data: vec![0.0; len],
        }
    }

    #[inline]
    pub fn format(&self) -> &Format {
        &self.format
    }

    #[inline]
    pub fn frame_capacity(&self) -> u32 {
        self.frame_capacity
    }

    #[inline]
    pub fn frame_length(&self) -> u32 {
        self.frame_length
    }

    pub fn set_frame_length(&mut self, frames: u32) -> Result<(), BufferError> {
        if frames > self.frame_capacity {
            return Err(BufferError::FrameLengthOutOfRange {
                requested: frames,
                capacity: self.frame_capacity,
            });
        }
        self.frame_length = frames;
        Ok(())
    }

    /// Make this buffer hold `format` with room for `frames`, reallocating
    /// only when the current storage is too small.
    pub fn reshape(&mut self, format: Format, frames: u32) {
        let needed = frames as usize * format.channel_count() as usize;
        if self.data.len() < needed {
            self.data.resize(needed, 0.0);
        }
        self.format = format;
        self.frame_capacity = (self.data.len() / format.channel_count().max(1) as usize) as u32;
        self.frame_length = frames;
    }

    fn run_range(&self, index: u32) -> core::ops::Range<usize> {
        let stride = self.format.stride() as usize;
        let start = index as usize * self.frame_capacity as usize * stride;
        start..start + self.frame_length as usize * stride
    }

    /// Sample run `index` (a channel for non-interleaved formats, everything for interleaved).
    ///
    /// # Panics
    ///
    /// Panics if `index >= format().buffer_count()`.
    pub fn data(&self, index: u32) -> &[f32] {
        assert!(index < self.format.buffer_count());
        &self.data[self.run_range(index)]
    }

    pub fn data_mut(&mut self, index: u32) -> &mut [f32] {
        assert!(index < self.format.buffer_count());
        let range = self.run_range(index);
        &mut self.data[range]
    }

    /// Zero the valid region.
    pub fn clear(&mut self) {
        for i in 0..self.format.buffer_count() {
            self.data_mut(i).fill(0.0);
        }
    }

    /// Copy samples and frame length from `other`, which must share this format.
    pub fn copy_from(&mut self, other: &PcmBuffer) -> Result<(), BufferError> {
        if self.format != other.format {
            return Err(BufferError::FormatMismatch);
        }
        self.set_frame_length(other.frame_length)?;
        for i in 0..self.format.buffer_count() {
            self.data_mut(i).copy_from_slice(other.data(i));
        }
        Ok(())
    }

    /// Add `other` into this buffer over the shorter of the two frame lengths.
    pub fn mix_from(&mut self, other: &PcmBuffer) -> Result<(), BufferError> {
        if self.format != other.format {
            return Err(BufferError::FormatMismatch);
        }
        for i in 0..self.format.buffer_count() {
            let src = other.data(i);
            for (d, s) in self.data_mut(i).iter_mut().zip(src) {
                *d += *s;
            }
        }
        Ok(())
    }

    /// Write the valid region into `out` as interleaved frames of `channels`
    /// channels. Missing source channels repeat the last one, extra ones are
    /// dropped. Returns the number of frames written.
    pub fn write_interleaved(&self, out: &mut [f32], channels: usize) -> usize {
        let src_channels = self.format.channel_count() as usize;
        if channels == 0 || src_channels == 0 {
            return 0;
        }
        let frames = (out.len() / channels).min(self.frame_length as usize);
        for frame in 0..frames {
            for ch in 0..channels {
                let src_ch = ch.min(src_channels - 1);
                out[frame * channels + ch] = self.sample(frame, src_ch);
            }
        }
        frames
    }

    /// Fill this buffer from interleaved frames of `channels` channels,
    /// setting the frame length to what fit.
    pub fn read_interleaved(&mut self, input: &[f32], channels: usize) -> usize {
        let dst_channels = self.format.channel_count() as usize;
        if channels == 0 || dst_channels == 0 {
            return 0;
        }
        let frames = (input.len() / channels).min(self.frame_capacity as usize);
        self.frame_length = frames as u32;
        for frame in 0..frames {
            for ch in 0..dst_channels {
                let src_ch = ch.min(channels - 1);
                self.set_sample(frame, ch, input[frame * channels + src_ch]);
            }
        }
        frames
    }

    fn sample_index(&self, frame: usize, channel: usize) -> usize {
        if self.format.is_interleaved() {
            frame * self.format.channel_count() as usize + channel
        } else {
            channel * self.frame_capacity as usize + frame
        }
    }

    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        self.data[self.sample_index(frame, channel)]
    }

    #[inline]
    pub fn set_sample(&mut self, frame: usize, channel: usize, value: f32) {
        let idx = self.sample_index(frame, channel);
        self.data[idx] = value;
    }
}

/// Shared block of zeros backing "nothing connected" reads.
///
/// Owned by the [`Graph`](crate::Graph) and handed to whoever needs to render
/// silence; the zeros are allocated on first use and only read afterwards.
#[derive(Debug)]
pub struct SilenceBuffer {
    frames: usize,
    zeros: OnceLock<Box<[f32]>>,
}

impl SilenceBuffer {
    pub fn new(frames: u32) -> Self {
        Self {
            frames: frames.max(1) as usize,
            zeros: OnceLock::new(),
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        self.zeros.get_or_init(|| vec![0.0; self.frames].into_boxed_slice())
    }

    /// Overwrite the valid region of `buffer` with silence.
    pub fn fill(&self, buffer: &mut PcmBuffer) {
        let zeros = self.as_slice();
        for i in 0..buffer.format().buffer_count() {
            for chunk in buffer.data_mut(i).chunks_mut(zeros.len()) {
                chunk.copy_from_slice(&zeros[..chunk.len()]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PcmFormat;

    fn stereo() -> Format {
        Format::float32(48000.0, 2)
    }

    #[test]
    fn frame_length_is_bounded_by_capacity() {
        let mut buf = PcmBuffer::new(stereo(), 8);
        assert!(buf.set_frame_length(4).is_ok());
        assert_eq!(buf.data(1).len(), 4);
        assert_eq!(
            buf.set_frame_length(9),
            Err(BufferError::FrameLengthOutOfRange {
                requested: 9,
                capacity: 8
            })
        );
    }

    #[test]
    fn copy_requires_matching_format() {
        let mut a = PcmBuffer::new(stereo(), 4);
        let b = PcmBuffer::new(Format::float32(44100.0, 2), 4);
        assert_eq!(a.copy_from(&b), Err(BufferError::FormatMismatch));
    }

    #[test]
    fn copy_and_mix() {
        let mut a = PcmBuffer::new(stereo(), 4);
        let mut b = PcmBuffer::new(stereo(), 4);
        b.data_mut(0).fill(0.5);
        b.data_mut(1).fill(-0.25);

        a.copy_from(&b).unwrap();
        a.mix_from(&b).unwrap();
        assert!(a.data(0).iter().all(|&s| s == 1.0));
        assert!(a.data(1).iter().all(|&s| s == -0.5));
    }

    #[test]
    fn interleave_round_trip_duplicates_mono() {
        let mut mono = PcmBuffer::new(Format::float32(48000.0, 1), 3);
        mono.data_mut(0).copy_from_slice(&[0.1, 0.2, 0.3]);

        let mut out = [0.0f32; 6];
        assert_eq!(mono.write_interleaved(&mut out, 2), 3);
        assert_eq!(out, [0.1, 0.1, 0.2, 0.2, 0.3, 0.3]);

        let mut back = PcmBuffer::new(stereo(), 8);
        assert_eq!(back.read_interleaved(&out, 2), 3);
        assert_eq!(back.frame_length(), 3);
        assert_eq!(back.data(1), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn interleaved_storage() {
        let format = Format::new(48000.0, 2, PcmFormat::Float32, true);
        let mut buf = PcmBuffer::new(format, 2);
        buf.set_sample(1, 1, 0.75);
        assert_eq!(buf.data(0), &[0.0, 0.0, 0.0, 0.75]);
    }

    #[test]
    fn silence_fills_buffers_larger_than_itself() {
        let silence = SilenceBuffer::new(3);
        let mut buf = PcmBuffer::new(stereo(), 8);
        buf.data_mut(0).fill(1.0);
        buf.data_mut(1).fill(1.0);
        silence.fill(&mut buf);
        assert!(buf.data(0).iter().chain(buf.data(1)).all(|&s| s == 0.0));
    }

    #[test]
    fn reshape_reuses_storage() {
        let mut buf = PcmBuffer::new(stereo(), 16);
        buf.reshape(Format::float32(48000.0, 1), 8);
        assert_eq!(buf.frame_capacity(), 32);
        assert_eq!(buf.frame_length(), 8);
        assert_eq!(buf.data(0).len(), 8);
    }
}
