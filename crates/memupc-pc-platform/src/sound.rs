//! Audio output mixing: two sources (speaker path and SB16 path) submit
//! 256-frame stereo buffers at 44.1 kHz; once both have delivered, the
//! mixed buffer goes to the front-end.

/// Stereo frames per delivery.
pub const AUDIO_BUFFER_FRAMES: usize = 256;

/// Interleaved samples per delivery.
pub const AUDIO_BUFFER_SAMPLES: usize = AUDIO_BUFFER_FRAMES * 2;

pub const SOUND_SOURCE_SPEAKER: usize = 0;
pub const SOUND_SOURCE_SB16: usize = 1;

const ALL_SOURCES: u8 = 0x3;

/// Receiver for completed 256-frame buffers.
pub trait PlaySound {
    fn play_sound(&mut self, samples: &[i16; AUDIO_BUFFER_SAMPLES]);
}

/// Accumulates per-source buffers; concurrent sources saturating-add.
pub struct Mixer {
    active_sources: u8,
    out: [i16; AUDIO_BUFFER_SAMPLES],
}

impl Mixer {
    pub fn new() -> Self {
        Mixer { active_sources: 0, out: [0; AUDIO_BUFFER_SAMPLES] }
    }

    pub fn reset(&mut self) {
        self.active_sources = 0;
    }

    /// Submit one source's buffer. Returns the mixed output once every
    /// source has delivered for this period; a source re-submitting
    /// before then is dropped.
    pub fn set(
        &mut self,
        source_id: usize,
        samples: &[i16; AUDIO_BUFFER_SAMPLES],
    ) -> Option<[i16; AUDIO_BUFFER_SAMPLES]> {
        let mask = 1u8 << source_id;
        if self.active_sources & mask != 0 {
            return None;
        }

        if self.active_sources == 0 {
            self.out = *samples;
        } else {
            for (out, sample) in self.out.iter_mut().zip(samples) {
                *out = out.saturating_add(*sample);
            }
        }
        self.active_sources |= mask;

        if self.active_sources == ALL_SOURCES {
            self.active_sources = 0;
            Some(self.out)
        } else {
            None
        }
    }
}

impl Default for Mixer {
    fn default() -> Self {
        Self::new()
    }
}
