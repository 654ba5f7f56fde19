use memupc_devices_storage::{AtapiDrive, IdeController, SECONDARY_PORTS};
use memupc_platform::{ClockBus, InterruptLines};
use memupc_storage::cd::{
    CdDiscKind, CdDrive, CdIndex, CdToc, CdTrack, Msf, CD_SECTOR_SIZE, CD_SUBCHANNEL_SIZE,
};

const HZ: i64 = 32_768_000;
const CC_PER_SECTOR: i64 = 1000;

/// Frame number of the first data/audio index on the test discs.
const TRACK_START: u32 = 150;

/// In-memory disc: one track starting at 00:02:00. Data discs carry
/// mode-1 frames whose user area is a per-frame pattern; audio discs
/// carry interleaved 16-bit PCM.
struct TestDisc {
    toc: Option<CdToc>,
    audio: bool,
    frames: u32,
    pos: u32,
    payload: Vec<Vec<u8>>,
}

impl TestDisc {
    fn data(payload: Vec<Vec<u8>>) -> Self {
        let frames = payload.len() as u32;
        TestDisc {
            toc: Some(Self::toc(frames, false)),
            audio: false,
            frames,
            pos: 0,
            payload,
        }
    }

    fn audio(frames: u32, left: i16, right: i16) -> Self {
        let mut frame = Vec::with_capacity(CD_SECTOR_SIZE);
        for _ in 0..CD_SECTOR_SIZE / 4 {
            frame.extend_from_slice(&left.to_le_bytes());
            frame.extend_from_slice(&right.to_le_bytes());
        }
        TestDisc {
            toc: Some(Self::toc(frames, true)),
            audio: true,
            frames,
            pos: 0,
            payload: vec![frame; frames as usize],
        }
    }

    fn empty() -> Self {
        TestDisc { toc: None, audio: false, frames: 0, pos: 0, payload: Vec::new() }
    }

    fn toc(frames: u32, audio: bool) -> CdToc {
        CdToc {
            kind: if audio { CdDiscKind::Audio } else { CdDiscKind::Mode1 },
            sessions: 1,
            tracks: vec![CdTrack {
                number: 1,
                is_audio: audio,
                four_channel_audio: false,
                copy_permitted: false,
                preemphasis: false,
                indexes: vec![CdIndex { number: 1, pos: Msf::from_frames(TRACK_START) }],
                last_sector: Msf::from_frames(TRACK_START + frames - 1),
            }],
        }
    }
}

impl CdDrive for TestDisc {
    fn media_present(&self) -> bool {
        self.toc.is_some()
    }

    fn toc(&self) -> Option<&CdToc> {
        self.toc.as_ref()
    }

    fn seek(&mut self, m: u8, s: u8, f: u8) -> bool {
        if self.toc.is_none() {
            return false;
        }
        let frames = Msf::new(m, s, f).to_frames();
        if frames >= TRACK_START && frames < TRACK_START + self.frames {
            self.pos = frames - TRACK_START;
            true
        } else {
            // The lead-in is seekable for TOC refreshes.
            frames < TRACK_START
        }
    }

    fn read_sector(&mut self, buf: &mut [u8; CD_SECTOR_SIZE], is_audio: &mut bool) -> bool {
        if self.toc.is_none() || self.pos >= self.frames {
            return false;
        }
        *is_audio = self.audio;
        buf.fill(0);
        if self.audio {
            buf.copy_from_slice(&self.payload[self.pos as usize]);
        } else {
            buf[15] = 0x01;
            buf[16..16 + 2048].copy_from_slice(&self.payload[self.pos as usize]);
        }
        self.pos += 1;
        true
    }

    fn read_subchannel_q(&mut self, buf: &mut [u8; CD_SUBCHANNEL_SIZE], crc_ok: &mut bool) -> bool {
        if self.toc.is_none() {
            return false;
        }
        buf.fill(0);
        buf[1] = 0x41;
        buf[2] = 0x01;
        buf[3] = 0x01;
        let abs = Msf::from_frames(TRACK_START + self.pos);
        buf[8] = abs.m;
        buf[9] = abs.s;
        buf[10] = abs.f;
        *crc_ok = true;
        true
    }
}

fn data_payload(blocks: usize) -> Vec<Vec<u8>> {
    (0..blocks)
        .map(|b| {
            let mut block: Vec<u8> =
                (0..2048).map(|i| (i as u8).wrapping_add(b as u8).wrapping_mul(3)).collect();
            if b == 0 {
                block[..3].copy_from_slice(b"FOO");
            }
            block
        })
        .collect()
}

struct Rig {
    clk: ClockBus,
    irq: InterruptLines,
    ide: IdeController,
}

impl Rig {
    fn new(disc: TestDisc) -> Self {
        let mut clk = ClockBus::new(HZ);
        let mut ide = IdeController::new(&mut clk);
        ide.config_write16(0x02, 0x0001);
        ide.config_write16(0x20, 0x8000);
        ide.config_write16(0x21, 0x8000);
        ide.attach_secondary_master_atapi(AtapiDrive::new(Box::new(disc)));
        let mut rig = Rig { clk, irq: InterruptLines::new(), ide };
        // Select the master on the secondary channel.
        rig.out8(SECONDARY_PORTS.cmd_base + 6, 0xA0);
        rig
    }

    fn out8(&mut self, port: u16, data: u8) {
        assert!(self.ide.port_write8(&mut self.clk, &mut self.irq, port, data));
    }

    fn out16(&mut self, port: u16, data: u16) {
        assert!(self.ide.port_write16(&mut self.clk, &mut self.irq, port, data));
    }

    fn in8(&mut self, port: u16) -> u8 {
        self.ide.port_read8(&mut self.clk, &mut self.irq, port).expect("port is decoded")
    }

    fn in16(&mut self, port: u16) -> u16 {
        self.ide.port_read16(&mut self.clk, &mut self.irq, port).expect("port is decoded")
    }

    fn settle(&mut self) {
        self.clk.add_cycles(CC_PER_SECTOR * 8);
    }

    fn send_packet(&mut self, pkt: &[u8; 12], byte_count: u16) {
        let base = SECONDARY_PORTS.cmd_base;
        self.out8(base + 1, 0x00);
        self.out8(base + 4, byte_count as u8);
        self.out8(base + 5, (byte_count >> 8) as u8);
        self.out8(base + 7, 0xA0);
        for i in 0..6 {
            self.out16(base, u16::from_le_bytes([pkt[2 * i], pkt[2 * i + 1]]));
        }
    }

    fn drain(&mut self, bytes: usize) -> Vec<u8> {
        self.settle();
        let mut out = Vec::with_capacity(bytes);
        for _ in 0..bytes.div_ceil(2) {
            out.extend_from_slice(&self.in16(SECONDARY_PORTS.cmd_base).to_le_bytes());
        }
        out.truncate(bytes);
        out
    }

    fn interrupt_reason(&mut self) -> u8 {
        self.in8(SECONDARY_PORTS.cmd_base + 2) & 0x07
    }

    fn status(&mut self) -> u8 {
        self.in8(SECONDARY_PORTS.cmd_base + 7)
    }
}

#[test]
fn inquiry_works_without_media() {
    let mut rig = Rig::new(TestDisc::empty());

    let mut pkt = [0u8; 12];
    pkt[0] = 0x12;
    pkt[4] = 48;
    rig.send_packet(&pkt, 48);
    let data = rig.drain(48);

    assert_eq!(data[0], 0x05, "CD-ROM peripheral type");
    assert_ne!(data[1] & 0x80, 0, "removable medium");
    assert_eq!(&data[8..32], b"MEMUPC  CD-ROM BASIC    ");

    // Draining completes the command: status phase, SRV, no error.
    assert_eq!(rig.interrupt_reason(), 0x03);
    let status = rig.status();
    assert_ne!(status & 0x10, 0, "SRV set");
    assert_eq!(status & 0x01, 0, "no CHK");
}

#[test]
fn test_unit_ready_without_media_reports_not_ready_sense() {
    let mut rig = Rig::new(TestDisc::empty());

    let pkt = [0u8; 12];
    rig.send_packet(&pkt, 0);

    assert!(rig.irq.level(15), "error completions still interrupt");
    assert_eq!(rig.interrupt_reason(), 0x03, "status phase");
    let status = rig.status();
    assert_ne!(status & 0x01, 0, "CHK set");
    let error = rig.in8(SECONDARY_PORTS.cmd_base + 1);
    assert_eq!(error >> 4, 0x02, "sense key NOT READY in the error register");

    // REQUEST SENSE returns the recorded sense data.
    let mut pkt = [0u8; 12];
    pkt[0] = 0x03;
    pkt[4] = 18;
    rig.send_packet(&pkt, 18);
    let sense = rig.drain(18);
    assert_eq!(sense[0], 0xF0);
    assert_eq!(sense[2], 0x02, "sense key");
    assert_eq!(sense[12], 0x3A, "additional sense: medium not present");
}

#[test]
fn read10_round_trips_one_logical_block() {
    let payload = data_payload(4);
    let expected = payload[0].clone();
    let mut rig = Rig::new(TestDisc::data(payload));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x28;
    pkt[2..6].copy_from_slice(&0u32.to_be_bytes());
    pkt[7..9].copy_from_slice(&1u16.to_be_bytes());
    rig.send_packet(&pkt, 2048);

    // Data phase: I/O=1, C/D=0, byte count published in LBA mid/hi.
    rig.settle();
    assert_eq!(rig.interrupt_reason(), 0x02);
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 4), 0x00);
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 5), 0x08);

    let data = rig.drain(2048);
    assert_eq!(&data[..3], b"FOO");
    assert_eq!(data, expected);

    assert_eq!(rig.interrupt_reason(), 0x03, "completion after the drain");
    assert_eq!(rig.status() & 0x01, 0);
}

#[test]
fn read10_spans_blocks_with_a_small_byte_count_limit() {
    let payload = data_payload(4);
    let flat: Vec<u8> = payload.iter().flatten().copied().collect();
    let mut rig = Rig::new(TestDisc::data(payload));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x28;
    pkt[2..6].copy_from_slice(&1u32.to_be_bytes());
    pkt[7..9].copy_from_slice(&2u16.to_be_bytes());
    // The host only accepts 1024 bytes per DRQ round.
    rig.send_packet(&pkt, 1024);

    let mut received = Vec::new();
    for _ in 0..4 {
        received.extend(rig.drain(1024));
    }
    assert_eq!(received, flat[2048..3 * 2048]);
    assert_eq!(rig.interrupt_reason(), 0x03);
}

#[test]
fn read_toc_format0_lists_the_track() {
    let mut rig = Rig::new(TestDisc::data(data_payload(4)));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x43;
    pkt[1] = 0x02; // MSF form.
    pkt[7..9].copy_from_slice(&12u16.to_be_bytes());
    rig.send_packet(&pkt, 12);
    let toc = rig.drain(12);

    assert_eq!(u16::from_be_bytes([toc[0], toc[1]]), 10, "TOC length");
    assert_eq!(toc[2], 1, "first track");
    assert_eq!(toc[3], 1, "track count");
    assert_eq!(toc[5], 0x14, "data track ADR/control");
    assert_eq!(toc[6], 1, "track number");
    assert_eq!(&toc[8..12], &[0x00, 0, 2, 0], "index 1 at 00:02:00");
}

#[test]
fn read_toc_format2_is_an_illegal_request() {
    let mut rig = Rig::new(TestDisc::data(data_payload(2)));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x43;
    pkt[7..9].copy_from_slice(&12u16.to_be_bytes());
    pkt[9] = 2 << 6;
    rig.send_packet(&pkt, 12);

    assert_ne!(rig.status() & 0x01, 0);
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 1) >> 4, 0x05);
}

#[test]
fn read_capacity_reports_last_lba_and_block_size() {
    let mut rig = Rig::new(TestDisc::data(data_payload(4)));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x25;
    rig.send_packet(&pkt, 8);
    let data = rig.drain(8);

    // Last frame is TRACK_START + 3; plus one, minus the lead-in.
    assert_eq!(u32::from_be_bytes([data[0], data[1], data[2], data[3]]), 4);
    assert_eq!(u32::from_be_bytes([data[4], data[5], data[6], data[7]]), 2048);
}

#[test]
fn mode_sense_returns_default_audio_control_page() {
    let mut rig = Rig::new(TestDisc::data(data_payload(2)));

    let mut pkt = [0u8; 12];
    pkt[0] = 0x1A;
    pkt[2] = 0x0E;
    pkt[4] = 24;
    rig.send_packet(&pkt, 24);
    let data = rig.drain(24);

    assert_eq!(data[2], 0x01, "data disc media type");
    assert_eq!(data[8], 0x0E, "page code");
    assert_eq!(data[9], 0x0E, "page length");
    assert_ne!(data[10] & 0x04, 0, "IMMED set by default");
    assert_eq!(data[10] & 0x02, 0, "SOTC clear by default");
    assert_eq!(data[16], 0x01, "port 0 routes left");
    assert_eq!(data[17], 0xFF, "port 0 at full volume");
    assert_eq!(data[18], 0x02, "port 1 routes right");
    assert_eq!(data[19], 0xFF, "port 1 at full volume");
}

#[test]
fn mode_select_updates_the_audio_control_page() {
    let mut rig = Rig::new(TestDisc::data(data_payload(2)));

    // MODE SELECT (10) with an 8-byte header and the 16-byte page.
    let mut pkt = [0u8; 12];
    pkt[0] = 0x55;
    pkt[1] = 0x10;
    pkt[7..9].copy_from_slice(&24u16.to_be_bytes());
    rig.send_packet(&pkt, 24);

    let mut param = vec![0u8; 24];
    param[8] = 0x0E;
    param[9] = 14;
    param[10] = 0x04; // IMMED, no SOTC.
    param[16] = 0x02; // Port 0 takes the right channel...
    param[17] = 0x80; // ...at half volume.
    param[18] = 0x01;
    param[19] = 0x40;
    for pair in param.chunks(2) {
        rig.out16(SECONDARY_PORTS.cmd_base, u16::from_le_bytes([pair[0], pair[1]]));
    }
    assert_eq!(rig.interrupt_reason(), 0x03);
    assert_eq!(rig.status() & 0x01, 0);

    // MODE SENSE of the current page reflects the change.
    let mut pkt = [0u8; 12];
    pkt[0] = 0x1A;
    pkt[2] = 0x0E;
    pkt[4] = 24;
    rig.send_packet(&pkt, 24);
    let data = rig.drain(24);
    assert_eq!(data[16], 0x02);
    assert_eq!(data[17], 0x80);
    assert_eq!(data[18], 0x01);
    assert_eq!(data[19], 0x40);
}

#[test]
fn unsupported_packet_opcode_aborts_softly() {
    let mut rig = Rig::new(TestDisc::data(data_payload(2)));

    let mut pkt = [0u8; 12];
    pkt[0] = 0xBD; // MECHANISM STATUS, not carried.
    rig.send_packet(&pkt, 0);

    assert_ne!(rig.status() & 0x01, 0);
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 1) >> 4, 0x05, "ILLEGAL REQUEST");
    assert_eq!(rig.interrupt_reason(), 0x03);
}

#[test]
fn identify_packet_device_describes_an_atapi_cdrom() {
    let mut rig = Rig::new(TestDisc::empty());

    rig.out8(SECONDARY_PORTS.cmd_base + 7, 0xA1);
    rig.settle();

    let mut words = [0u16; 256];
    for word in words.iter_mut() {
        *word = rig.in16(SECONDARY_PORTS.cmd_base);
    }
    assert_eq!(words[0], 0x8580, "ATAPI, CD-ROM, 12-byte packets");
    let model: String = words[27..47]
        .iter()
        .flat_map(|w| [(w >> 8) as u8 as char, (w & 0xFF) as u8 as char])
        .collect();
    assert!(model.starts_with("CD-ROM  memuPC"));
}

#[test]
fn identify_device_on_a_packet_drive_aborts_with_the_signature() {
    let mut rig = Rig::new(TestDisc::empty());

    rig.out8(SECONDARY_PORTS.cmd_base + 7, 0xEC);

    let status = rig.status();
    assert_ne!(status & 0x01, 0, "aborted");
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 4), 0x14);
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 5), 0xEB);
}

#[test]
fn audio_playback_applies_routing_and_volume() {
    let mut rig = Rig::new(TestDisc::audio(4, 1000, -2000));

    // PLAY AUDIO MSF from 00:02:00 for two frames.
    let mut pkt = [0u8; 12];
    pkt[0] = 0x47;
    pkt[3..6].copy_from_slice(&[0, 2, 0]);
    pkt[6..9].copy_from_slice(&[0, 2, 2]);
    rig.send_packet(&pkt, 0);
    assert_eq!(rig.status() & 0x01, 0, "play accepted");

    let (l, r) = rig.ide.next_cd_audio_sample(&mut rig.irq);
    assert_eq!((l, r), (1000, -2000));

    // Drain both frames.
    let samples_per_frame = CD_SECTOR_SIZE / 4;
    for _ in 1..2 * samples_per_frame {
        let (l, r) = rig.ide.next_cd_audio_sample(&mut rig.irq);
        assert_eq!((l, r), (1000, -2000));
    }

    // Past the end: playback completes and goes silent.
    assert_eq!(rig.ide.next_cd_audio_sample(&mut rig.irq), (0, 0));

    // READ SUB-CHANNEL reports the completed status once.
    let mut pkt = [0u8; 12];
    pkt[0] = 0x42;
    pkt[7..9].copy_from_slice(&4u16.to_be_bytes());
    rig.send_packet(&pkt, 4);
    let data = rig.drain(4);
    assert_eq!(data[1], 0x13, "audio status: completed");

    rig.send_packet(&pkt, 4);
    let data = rig.drain(4);
    assert_eq!(data[1], 0x15, "status byte was consumed");
}

#[test]
fn pause_resume_requires_active_playback() {
    let mut rig = Rig::new(TestDisc::audio(4, 1, 1));

    let mut pause = [0u8; 12];
    pause[0] = 0x4B;
    rig.send_packet(&pause, 0);
    assert_ne!(rig.status() & 0x01, 0);
    assert_eq!(rig.in8(SECONDARY_PORTS.cmd_base + 1) >> 4, 0x0B, "ABORTED COMMAND");

    let mut play = [0u8; 12];
    play[0] = 0x47;
    play[3..6].copy_from_slice(&[0, 2, 0]);
    play[6..9].copy_from_slice(&[0, 2, 2]);
    rig.send_packet(&play, 0);
    let _ = rig.status();

    rig.send_packet(&pause, 0);
    assert_eq!(rig.status() & 0x01, 0);
    assert_eq!(rig.ide.next_cd_audio_sample(&mut rig.irq), (0, 0), "paused drive is silent");

    // Resume.
    let mut resume = [0u8; 12];
    resume[0] = 0x4B;
    resume[8] = 0x01;
    rig.send_packet(&resume, 0);
    let _ = rig.status();
    assert_ne!(rig.ide.next_cd_audio_sample(&mut rig.irq), (0, 0));
}
