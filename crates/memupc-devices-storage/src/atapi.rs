//! CD-ROM drive state for the ATAPI packet layer: sense data, mode
//! pages, the logical-block staging buffer and the audio play engine.

use memupc_storage::cd::{CdDiscKind, CdDrive, Msf, CD_SECTOR_SIZE, CD_SUBCHANNEL_SIZE};

pub(crate) const SENSE_DATA_SIZE: usize = 19;

// Sense keys.
pub(crate) const SENSE_KEY_NOT_READY: u8 = 0x02;
pub(crate) const SENSE_KEY_MEDIUM_ERROR: u8 = 0x03;
pub(crate) const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x05;
pub(crate) const SENSE_KEY_ABORTED_COMMAND: u8 = 0x0B;

// Additional sense code / qualifier pairs.
pub(crate) const ADD_SENSE_NO_SEEK_COMPLETE: u16 = 0x0200;
pub(crate) const ADD_SENSE_PARAMETER_LIST_LENGTH_ERROR: u16 = 0x1A00;
pub(crate) const ADD_SENSE_INVALID_FIELD_IN_CDB: u16 = 0x2400;
pub(crate) const ADD_SENSE_PARAMETER_VALUE_INVALID: u16 = 0x2602;
pub(crate) const ADD_SENSE_CAN_NOT_READ_UNK_FORMAT: u16 = 0x3001;
pub(crate) const ADD_SENSE_CAN_NOT_READ_INCOMPATIBLE_FORMAT: u16 = 0x3002;
pub(crate) const ADD_SENSE_MEDIUM_NOT_PRESENT: u16 = 0x3A00;
pub(crate) const ADD_SENSE_OVERLAPPED_COMMANDS: u16 = 0x4E00;
pub(crate) const ADD_SENSE_ILLEGAL_MODE_FOR_THIS_TRACK: u16 = 0x6400;
pub(crate) const ADD_SENSE_AUDIO_PLAY_OPERATION_ABORTED: u16 = 0xB900;

/// Audio status byte returned by READ SUB-CHANNEL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AudioStatus {
    InProgress,
    Paused,
    Completed,
    Error,
    None,
}

impl AudioStatus {
    pub(crate) fn as_byte(self) -> u8 {
        match self {
            AudioStatus::InProgress => 0x11,
            AudioStatus::Paused => 0x12,
            AudioStatus::Completed => 0x13,
            AudioStatus::Error => 0x14,
            AudioStatus::None => 0x15,
        }
    }
}

/// CD-ROM parameters mode page (0x0D).
#[derive(Debug, Clone, Copy)]
pub(crate) struct CdromParametersPage {
    pub inactivity_timer_multiplier: u8,
    pub seconds_per_minute: u8,
    pub frames_per_second: u8,
}

/// CD-ROM audio control mode page (0x0E).
#[derive(Debug, Clone, Copy)]
pub(crate) struct AudioControlPage {
    pub immed: bool,
    pub sotc: bool,
    pub port0_channel: u8,
    pub port0_volume: u8,
    pub port1_channel: u8,
    pub port1_volume: u8,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct CdromModePages {
    pub lblock_size: u32,
    pub sectors_per_block: u32,
    pub parameters: CdromParametersPage,
    pub audio_control: AudioControlPage,
}

impl Default for CdromModePages {
    fn default() -> Self {
        CdromModePages {
            lblock_size: 2048,
            sectors_per_block: 1,
            parameters: CdromParametersPage {
                // Eight minutes of inactivity.
                inactivity_timer_multiplier: 0x0D,
                seconds_per_minute: 0x3C,
                frames_per_second: 0x4B,
            },
            audio_control: AudioControlPage {
                immed: true,
                sotc: false,
                port0_channel: 0x01,
                port0_volume: 0xFF,
                port1_channel: 0x02,
                port1_volume: 0xFF,
            },
        }
    }
}

/// Staging buffer for one logical block extracted from a raw frame.
pub(crate) struct LogicalBlockBuf {
    pub data: [u8; CD_SECTOR_SIZE],
    pub pos: usize,
    pub len: usize,
}

/// Audio playback state: the current raw sector, the play cursor and the
/// stop position.
pub(crate) struct AudioState {
    pub status: AudioStatus,
    pub sector: [u8; CD_SECTOR_SIZE],
    pub pos: usize,
    pub len: usize,
    pub current: Msf,
    pub end: Msf,
}

pub struct AtapiDrive {
    pub(crate) cd: Box<dyn CdDrive>,
    pub(crate) sense: [u8; SENSE_DATA_SIZE],
    pub(crate) mode: CdromModePages,
    pub(crate) busy: bool,
    pub(crate) playing: bool,
    pub(crate) paused: bool,
    pub(crate) locked: bool,
    pub(crate) block: LogicalBlockBuf,
    pub(crate) audio: AudioState,
    pub(crate) subchannel_q: [u8; CD_SUBCHANNEL_SIZE],
}

impl AtapiDrive {
    pub fn new(cd: Box<dyn CdDrive>) -> Self {
        let mut drive = AtapiDrive {
            cd,
            sense: [0; SENSE_DATA_SIZE],
            mode: CdromModePages::default(),
            busy: false,
            playing: false,
            paused: false,
            locked: false,
            block: LogicalBlockBuf { data: [0; CD_SECTOR_SIZE], pos: 0, len: 0 },
            audio: AudioState {
                status: AudioStatus::None,
                sector: [0; CD_SECTOR_SIZE],
                pos: 0,
                len: 0,
                current: Msf::new(0, 0, 0),
                end: Msf::new(0, 0, 0),
            },
            subchannel_q: [0; CD_SUBCHANNEL_SIZE],
        };
        drive.reset();
        drive
    }

    pub(crate) fn reset(&mut self) {
        self.sense = [0; SENSE_DATA_SIZE];
        self.mode = CdromModePages::default();
        self.busy = false;
        self.playing = false;
        self.paused = false;
        self.locked = false;
        self.block.pos = 0;
        self.block.len = 0;
        self.audio.pos = 0;
        self.audio.len = 0;
        self.audio.status = AudioStatus::None;
        self.subchannel_q = [0; CD_SUBCHANNEL_SIZE];
    }

    /// Refresh the sense buffer for a failed (or about-to-fail) command.
    pub(crate) fn set_sense(&mut self, sense_key: u8, add_sense: u16) {
        self.sense = [0; SENSE_DATA_SIZE];
        // Error code: current error, valid bit set.
        self.sense[0] = 0x80 | 0x70;
        self.sense[2] = sense_key;
        self.sense[7] = 18 - 7;
        self.sense[12] = (add_sense >> 8) as u8;
        self.sense[13] = add_sense as u8;
    }

    pub(crate) fn stop_playing(&mut self, status: AudioStatus) {
        self.playing = false;
        self.paused = false;
        self.audio.status = status;
    }

    /// Media type byte for the mode-sense header. The door is always
    /// modelled closed.
    pub(crate) fn media_type_byte(&self) -> u8 {
        match self.cd.toc() {
            None => 0x70,
            Some(toc) => match toc.kind {
                CdDiscKind::Audio => 0x02,
                CdDiscKind::Mode1 | CdDiscKind::Mode2 => 0x01,
                CdDiscKind::Mode1Audio | CdDiscKind::Mode2Audio => 0x03,
                CdDiscKind::Unknown => 0x00,
            },
        }
    }
}
