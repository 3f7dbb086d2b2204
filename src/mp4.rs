//! Fragmented MP4 writer for a single H.264 video track.
//!
//! File layout:
//!
//! ```text
//! ftyp
//! moov   (mvhd, trak/avc1/avcC, mvex/trex; no samples)
//! moof + mdat   repeated, each fragment starts on a keyframe
//! mfra   (tfra entry per fragment, mfro trailer)
//! ```
//!
//! Fragments are closed at the first keyframe after the target fragment
//! duration, so a crash mid-recording still leaves every completed fragment
//! playable. The trailing `mfra` index lets players seek without scanning.
//!
//! The module also contains a small box parser ([`inspect`]) used by the
//! offline reader and the tests.

use std::io::{self, Write};

/// H.264 NAL unit type constants.
pub mod nal_unit_type {
    pub const NON_IDR_SLICE: u8 = 1;
    pub const IDR_SLICE: u8 = 5;
    pub const SEI: u8 = 6;
    pub const SPS: u8 = 7;
    pub const PPS: u8 = 8;
    pub const AUD: u8 = 9;
}

/// One NAL unit without start code or length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub data: Vec<u8>,
    pub nal_type: u8,
}

impl NalUnit {
    pub fn is_idr(&self) -> bool {
        self.nal_type == nal_unit_type::IDR_SLICE
    }

    pub fn is_slice(&self) -> bool {
        matches!(
            self.nal_type,
            nal_unit_type::IDR_SLICE | nal_unit_type::NON_IDR_SLICE
        )
    }
}

/// An Annex B access unit split into parameter sets and everything else.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    /// Non parameter-set NAL units in bitstream order.
    pub nals: Vec<NalUnit>,
    pub sps: Option<Vec<u8>>,
    pub pps: Option<Vec<u8>>,
    pub is_keyframe: bool,
}

/// Split Annex B data on 3- and 4-byte start codes.
pub fn parse_annex_b(data: &[u8]) -> ParsedFrame {
    // (start code position, payload start)
    let mut marks = Vec::new();
    let mut i = 0;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if data[i + 2] == 1 {
                marks.push((i, i + 3));
                i += 3;
                continue;
            }
            if data[i + 2] == 0 && i + 4 <= data.len() && data[i + 3] == 1 {
                marks.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut frame = ParsedFrame::default();
    for (n, &(_, start)) in marks.iter().enumerate() {
        let end = marks.get(n + 1).map_or(data.len(), |&(next, _)| next);
        if start >= end {
            continue;
        }
        let payload = &data[start..end];
        let nal_type = payload[0] & 0x1F;
        match nal_type {
            nal_unit_type::SPS => frame.sps = Some(payload.to_vec()),
            nal_unit_type::PPS => frame.pps = Some(payload.to_vec()),
            nal_unit_type::AUD => {}
            _ => {
                frame.is_keyframe |= nal_type == nal_unit_type::IDR_SLICE;
                frame.nals.push(NalUnit {
                    data: payload.to_vec(),
                    nal_type,
                });
            }
        }
    }
    frame
}

/// Length-prefix (AVCC) form of the given NAL units.
fn to_avcc(nals: &[NalUnit]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nals.iter().map(|n| 4 + n.data.len()).sum());
    for nal in nals {
        buf.extend_from_slice(&(nal.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&nal.data);
    }
    buf
}

#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("first sample must be a keyframe carrying SPS and PPS")]
    MissingParameterSets,
    #[error("decode time {dts} does not follow previous sample at {previous}")]
    NonMonotonic { dts: u64, previous: u64 },
    #[error("encoded sample contains no slice data")]
    EmptySample,
    #[error("malformed mp4: {0}")]
    Malformed(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone)]
pub struct Mp4Config {
    pub width: u32,
    pub height: u32,
    /// Ticks per second for every time field in the file.
    pub timescale: u32,
    /// Nominal sample duration in ticks, used for the final sample.
    pub default_duration: u32,
    /// Target fragment length; fragments only break on keyframes.
    pub fragment_duration_ms: u32,
}

impl Mp4Config {
    /// Constant frame rate track with a `fps * 1000` timescale.
    pub fn for_frame_rate(width: u32, height: u32, fps: u32, fragment_duration_ms: u32) -> Self {
        Self {
            width,
            height,
            timescale: fps * 1000,
            default_duration: 1000,
            fragment_duration_ms,
        }
    }
}

/// Totals for a finished file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Mp4Summary {
    pub samples: u64,
    pub fragments: u32,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomAccessPoint {
    /// Decode time of the fragment's first sample.
    pub time: u64,
    /// Byte offset of the fragment's `moof`.
    pub moof_offset: u64,
}

struct PendingSample {
    data: Vec<u8>,
    dts: u64,
    is_sync: bool,
}

const TRACK_ID: u32 = 1;
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;
const NON_SYNC_BIT: u32 = 0x0001_0000;

pub struct FragmentedMp4Writer<W: Write> {
    out: W,
    config: Mp4Config,
    sps: Vec<u8>,
    pps: Vec<u8>,
    header_written: bool,
    pending: Vec<PendingSample>,
    last_dts: Option<u64>,
    sequence_number: u32,
    position: u64,
    random_access: Vec<RandomAccessPoint>,
    samples_written: u64,
}

impl<W: Write> FragmentedMp4Writer<W> {
    pub fn new(out: W, config: Mp4Config) -> Self {
        Self {
            out,
            config,
            sps: Vec::new(),
            pps: Vec::new(),
            header_written: false,
            pending: Vec::new(),
            last_dts: None,
            sequence_number: 1,
            position: 0,
            random_access: Vec::new(),
            samples_written: 0,
        }
    }

    pub fn config(&self) -> &Mp4Config {
        &self.config
    }

    /// Bytes emitted so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn pending_sample_count(&self) -> usize {
        self.pending.len()
    }

    /// Add one encoded access unit at decode time `dts` (in track ticks).
    ///
    /// The first sample must be an IDR frame with in-band SPS/PPS; the header
    /// is written when it arrives.
    pub fn write_sample(&mut self, annex_b: &[u8], dts: u64) -> Result<(), MuxError> {
        if let Some(previous) = self.last_dts {
            if dts <= previous {
                return Err(MuxError::NonMonotonic { dts, previous });
            }
        }

        let parsed = parse_annex_b(annex_b);
        if parsed.nals.is_empty() {
            return Err(MuxError::EmptySample);
        }

        if !self.header_written {
            match (parsed.is_keyframe, &parsed.sps, &parsed.pps) {
                (true, Some(sps), Some(pps)) => {
                    self.sps = sps.clone();
                    self.pps = pps.clone();
                }
                _ => return Err(MuxError::MissingParameterSets),
            }
            let mut header = Vec::new();
            self.write_ftyp(&mut header);
            self.write_moov(&mut header);
            self.emit(&header)?;
            self.header_written = true;
        }

        if parsed.is_keyframe && self.fragment_is_due(dts) {
            self.flush_fragment(Some(dts))?;
        }

        self.pending.push(PendingSample {
            data: to_avcc(&parsed.nals),
            dts,
            is_sync: parsed.is_keyframe,
        });
        self.last_dts = Some(dts);
        Ok(())
    }

    /// Write the last fragment and the random-access index, then hand back
    /// the sink.
    pub fn finish(mut self) -> Result<(W, Mp4Summary), MuxError> {
        self.flush_fragment(None)?;
        if self.header_written {
            let mut mfra = Vec::new();
            self.write_mfra(&mut mfra);
            self.emit(&mfra)?;
        }
        self.out.flush()?;
        let summary = Mp4Summary {
            samples: self.samples_written,
            fragments: self.random_access.len() as u32,
            bytes: self.position,
        };
        Ok((self.out, summary))
    }

    fn fragment_is_due(&self, dts: u64) -> bool {
        let Some(first) = self.pending.first() else {
            return false;
        };
        let elapsed_ms = (dts - first.dts) * 1000 / self.config.timescale as u64;
        elapsed_ms >= self.config.fragment_duration_ms as u64
    }

    fn emit(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    /// Write pending samples as one `moof`+`mdat`. `next_dts` closes the
    /// duration of the last pending sample.
    fn flush_fragment(&mut self, next_dts: Option<u64>) -> Result<(), MuxError> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let durations: Vec<u32> = self
            .pending
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let next = self.pending.get(i + 1).map(|n| n.dts).or(next_dts);
                next.map_or(self.config.default_duration, |n| (n - s.dts) as u32)
            })
            .collect();

        let mut fragment = Vec::new();
        self.write_moof(&mut fragment, &durations);
        let mdat_len: usize = self.pending.iter().map(|s| s.data.len()).sum();
        fragment.extend_from_slice(&((8 + mdat_len) as u32).to_be_bytes());
        fragment.extend_from_slice(b"mdat");
        for sample in &self.pending {
            fragment.extend_from_slice(&sample.data);
        }

        self.random_access.push(RandomAccessPoint {
            time: self.pending[0].dts,
            moof_offset: self.position,
        });
        self.emit(&fragment)?;
        self.samples_written += self.pending.len() as u64;
        self.sequence_number += 1;
        self.pending.clear();
        Ok(())
    }

    fn write_ftyp(&self, buf: &mut Vec<u8>) {
        write_box(buf, b"ftyp", |b| {
            b.extend_from_slice(b"isom");
            b.extend_from_slice(&0x200u32.to_be_bytes());
            for brand in [b"isom", b"iso6", b"avc1", b"mp41"] {
                b.extend_from_slice(brand);
            }
        });
    }

    fn write_moov(&self, buf: &mut Vec<u8>) {
        write_box(buf, b"moov", |b| {
            write_full_box(b, b"mvhd", 0, 0, |c| {
                c.extend_from_slice(&[0; 8]); // creation, modification
                c.extend_from_slice(&self.config.timescale.to_be_bytes());
                c.extend_from_slice(&0u32.to_be_bytes()); // duration lives in fragments
                c.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
                c.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
                c.extend_from_slice(&[0; 10]);
                write_unity_matrix(c);
                c.extend_from_slice(&[0; 24]);
                c.extend_from_slice(&(TRACK_ID + 1).to_be_bytes());
            });
            self.write_trak(b);
            write_box(b, b"mvex", |m| {
                write_full_box(m, b"trex", 0, 0, |c| {
                    c.extend_from_slice(&TRACK_ID.to_be_bytes());
                    c.extend_from_slice(&1u32.to_be_bytes()); // sample description index
                    c.extend_from_slice(&self.config.default_duration.to_be_bytes());
                    c.extend_from_slice(&0u32.to_be_bytes());
                    c.extend_from_slice(&SAMPLE_FLAGS_NON_SYNC.to_be_bytes());
                });
            });
        });
    }

    fn write_trak(&self, buf: &mut Vec<u8>) {
        write_box(buf, b"trak", |b| {
            // enabled | in movie
            write_full_box(b, b"tkhd", 0, 3, |c| {
                c.extend_from_slice(&[0; 8]);
                c.extend_from_slice(&TRACK_ID.to_be_bytes());
                c.extend_from_slice(&[0; 4]);
                c.extend_from_slice(&0u32.to_be_bytes()); // duration
                c.extend_from_slice(&[0; 8]);
                c.extend_from_slice(&[0; 8]); // layer, alternate group, volume, reserved
                write_unity_matrix(c);
                c.extend_from_slice(&(self.config.width << 16).to_be_bytes());
                c.extend_from_slice(&(self.config.height << 16).to_be_bytes());
            });
            write_box(b, b"mdia", |m| {
                write_full_box(m, b"mdhd", 0, 0, |c| {
                    c.extend_from_slice(&[0; 8]);
                    c.extend_from_slice(&self.config.timescale.to_be_bytes());
                    c.extend_from_slice(&0u32.to_be_bytes());
                    c.extend_from_slice(&0x55c4u16.to_be_bytes()); // "und"
                    c.extend_from_slice(&0u16.to_be_bytes());
                });
                write_full_box(m, b"hdlr", 0, 0, |c| {
                    c.extend_from_slice(&0u32.to_be_bytes());
                    c.extend_from_slice(b"vide");
                    c.extend_from_slice(&[0; 12]);
                    c.extend_from_slice(b"ColorHandler\0");
                });
                write_box(m, b"minf", |n| {
                    write_full_box(n, b"vmhd", 0, 1, |c| c.extend_from_slice(&[0; 8]));
                    write_box(n, b"dinf", |d| {
                        write_full_box(d, b"dref", 0, 0, |c| {
                            c.extend_from_slice(&1u32.to_be_bytes());
                            // self-contained
                            write_full_box(c, b"url ", 0, 1, |_| {});
                        });
                    });
                    self.write_stbl(n);
                });
            });
        });
    }

    fn write_stbl(&self, buf: &mut Vec<u8>) {
        write_box(buf, b"stbl", |b| {
            write_full_box(b, b"stsd", 0, 0, |c| {
                c.extend_from_slice(&1u32.to_be_bytes());
                self.write_avc1(c);
            });
            for empty in [b"stts", b"stsc", b"stco"] {
                write_full_box(b, empty, 0, 0, |c| c.extend_from_slice(&0u32.to_be_bytes()));
            }
            write_full_box(b, b"stsz", 0, 0, |c| c.extend_from_slice(&[0; 8]));
        });
    }

    fn write_avc1(&self, buf: &mut Vec<u8>) {
        write_box(buf, b"avc1", |b| {
            b.extend_from_slice(&[0; 6]);
            b.extend_from_slice(&1u16.to_be_bytes()); // data reference index
            b.extend_from_slice(&[0; 16]);
            b.extend_from_slice(&(self.config.width as u16).to_be_bytes());
            b.extend_from_slice(&(self.config.height as u16).to_be_bytes());
            b.extend_from_slice(&0x0048_0000u32.to_be_bytes()); // 72 dpi
            b.extend_from_slice(&0x0048_0000u32.to_be_bytes());
            b.extend_from_slice(&0u32.to_be_bytes());
            b.extend_from_slice(&1u16.to_be_bytes()); // frames per sample

            let mut compressor = [0u8; 32];
            let name = b"scenerec";
            compressor[0] = name.len() as u8;
            compressor[1..=name.len()].copy_from_slice(name);
            b.extend_from_slice(&compressor);

            b.extend_from_slice(&0x0018u16.to_be_bytes());
            b.extend_from_slice(&(-1i16).to_be_bytes());

            write_box(b, b"avcC", |c| {
                c.push(1);
                match self.sps.get(1..4) {
                    Some(profile) => c.extend_from_slice(profile),
                    None => c.extend_from_slice(&[0x42, 0xC0, 0x1F]),
                }
                c.push(0xFF); // 4-byte NAL lengths
                c.push(0xE1); // one SPS
                c.extend_from_slice(&(self.sps.len() as u16).to_be_bytes());
                c.extend_from_slice(&self.sps);
                c.push(1);
                c.extend_from_slice(&(self.pps.len() as u16).to_be_bytes());
                c.extend_from_slice(&self.pps);
            });
        });
    }

    fn write_moof(&self, buf: &mut Vec<u8>, durations: &[u32]) {
        let moof_start = buf.len();
        let mut data_offset_at = 0;
        write_box(buf, b"moof", |b| {
            write_full_box(b, b"mfhd", 0, 0, |c| {
                c.extend_from_slice(&self.sequence_number.to_be_bytes());
            });
            write_box(b, b"traf", |t| {
                // default-base-is-moof
                write_full_box(t, b"tfhd", 0, 0x02_0000, |c| {
                    c.extend_from_slice(&TRACK_ID.to_be_bytes());
                });
                write_full_box(t, b"tfdt", 1, 0, |c| {
                    c.extend_from_slice(&self.pending[0].dts.to_be_bytes());
                });
                // data offset, sample duration, size and flags present
                write_full_box(t, b"trun", 0, 0x00_0701, |c| {
                    c.extend_from_slice(&(self.pending.len() as u32).to_be_bytes());
                    data_offset_at = c.len();
                    c.extend_from_slice(&0u32.to_be_bytes());
                    for (sample, duration) in self.pending.iter().zip(durations) {
                        c.extend_from_slice(&duration.to_be_bytes());
                        c.extend_from_slice(&(sample.data.len() as u32).to_be_bytes());
                        let flags = if sample.is_sync {
                            SAMPLE_FLAGS_SYNC
                        } else {
                            SAMPLE_FLAGS_NON_SYNC
                        };
                        c.extend_from_slice(&flags.to_be_bytes());
                    }
                });
            });
        });
        // Sample data starts right after the mdat header that follows moof.
        let data_offset = (buf.len() - moof_start + 8) as u32;
        buf[data_offset_at..data_offset_at + 4].copy_from_slice(&data_offset.to_be_bytes());
    }

    fn write_mfra(&self, buf: &mut Vec<u8>) {
        let start = buf.len();
        write_box(buf, b"mfra", |b| {
            write_full_box(b, b"tfra", 1, 0, |c| {
                c.extend_from_slice(&TRACK_ID.to_be_bytes());
                c.extend_from_slice(&0u32.to_be_bytes()); // 1-byte traf/trun/sample numbers
                c.extend_from_slice(&(self.random_access.len() as u32).to_be_bytes());
                for point in &self.random_access {
                    c.extend_from_slice(&point.time.to_be_bytes());
                    c.extend_from_slice(&point.moof_offset.to_be_bytes());
                    c.extend_from_slice(&[1, 1, 1]);
                }
            });
            // mfro carries the size of the enclosing mfra, itself included.
            let mfra_len = (b.len() - start + 16) as u32;
            write_full_box(b, b"mfro", 0, 0, |c| {
                c.extend_from_slice(&mfra_len.to_be_bytes());
            });
        });
    }
}

/// Append a box, patching its size once `content` has written the body.
fn write_box(buf: &mut Vec<u8>, box_type: &[u8; 4], content: impl FnOnce(&mut Vec<u8>)) {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(box_type);
    content(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

fn write_full_box(
    buf: &mut Vec<u8>,
    box_type: &[u8; 4],
    version: u8,
    flags: u32,
    content: impl FnOnce(&mut Vec<u8>),
) {
    write_box(buf, box_type, |b| {
        b.push(version);
        b.extend_from_slice(&flags.to_be_bytes()[1..]);
        content(b);
    });
}

fn write_unity_matrix(buf: &mut Vec<u8>) {
    for m in [0x0001_0000u32, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000] {
        buf.extend_from_slice(&m.to_be_bytes());
    }
}

// ============================================================================
// Box parsing
// ============================================================================

#[derive(Debug, Clone)]
pub struct BoxHeader {
    pub box_type: [u8; 4],
    pub offset: usize,
    pub size: usize,
}

impl BoxHeader {
    /// Body bytes of this box within `data`.
    pub fn content<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        let start = self.offset + 8;
        let end = (self.offset + self.size).min(data.len());
        data.get(start..end).unwrap_or(&[])
    }
}

/// Top-level boxes in `data`. Stops at the first malformed header.
pub fn iter_boxes(data: &[u8]) -> Vec<BoxHeader> {
    let mut boxes = Vec::new();
    let mut offset = 0;
    while let (Some(size), Some(box_type)) = (be_u32(data, offset), data.get(offset + 4..offset + 8)) {
        let size = size as usize;
        if size < 8 {
            break;
        }
        boxes.push(BoxHeader {
            box_type: [box_type[0], box_type[1], box_type[2], box_type[3]],
            offset,
            size: size.min(data.len() - offset),
        });
        offset += size;
    }
    boxes
}

pub fn find_box(data: &[u8], box_type: &[u8; 4]) -> Option<BoxHeader> {
    iter_boxes(data)
        .into_iter()
        .find(|b| &b.box_type == box_type)
}

/// Body of the box reached by following `path` through nested containers.
pub fn find_box_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    let Some((first, rest)) = path.split_first() else {
        return Some(data);
    };
    let content = find_box(data, first)?.content(data);
    find_box_path(content, rest)
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    Some(u16::from_be_bytes(data.get(at..at + 2)?.try_into().ok()?))
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    Some(u32::from_be_bytes(data.get(at..at + 4)?.try_into().ok()?))
}

fn be_u64(data: &[u8], at: usize) -> Option<u64> {
    Some(u64::from_be_bytes(data.get(at..at + 8)?.try_into().ok()?))
}

fn malformed(what: &str) -> MuxError {
    MuxError::Malformed(what.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub dts: u64,
    pub duration: u32,
    pub size: u32,
    pub is_sync: bool,
}

/// Structure of a fragmented MP4 file as written by [`FragmentedMp4Writer`].
#[derive(Debug, Clone)]
pub struct Mp4Inspection {
    pub timescale: u32,
    pub width: u32,
    pub height: u32,
    pub samples: Vec<SampleInfo>,
    pub fragments: u32,
    /// Entries of the trailing `mfra` index; empty if the file has none.
    pub random_access: Vec<RandomAccessPoint>,
    pub has_mfra: bool,
}

impl Mp4Inspection {
    /// Presentation time of every sample in seconds.
    pub fn sample_times(&self) -> Vec<f64> {
        self.samples
            .iter()
            .map(|s| s.dts as f64 / self.timescale as f64)
            .collect()
    }

    pub fn duration_secs(&self) -> f64 {
        self.samples
            .last()
            .map_or(0.0, |s| (s.dts + s.duration as u64) as f64 / self.timescale as f64)
    }
}

pub fn inspect(data: &[u8]) -> Result<Mp4Inspection, MuxError> {
    let boxes = iter_boxes(data);
    if boxes.first().map(|b| &b.box_type) != Some(b"ftyp") {
        return Err(malformed("file does not start with ftyp"));
    }

    let mdhd = find_box_path(data, &[b"moov", b"trak", b"mdia", b"mdhd"])
        .ok_or_else(|| malformed("missing mdhd"))?;
    let timescale = be_u32(mdhd, 12).ok_or_else(|| malformed("short mdhd"))?;

    let stsd = find_box_path(data, &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"])
        .ok_or_else(|| malformed("missing stsd"))?;
    let entries = stsd.get(8..).ok_or_else(|| malformed("short stsd"))?;
    let avc1 = find_box(entries, b"avc1")
        .ok_or_else(|| malformed("missing avc1 sample entry"))?
        .content(entries);
    let width = be_u16(avc1, 24).ok_or_else(|| malformed("short avc1"))? as u32;
    let height = be_u16(avc1, 26).ok_or_else(|| malformed("short avc1"))? as u32;
    if avc1.get(78..).and_then(|rest| find_box(rest, b"avcC")).is_none() {
        return Err(malformed("missing avcC"));
    }

    let mut samples = Vec::new();
    let mut fragments = 0;
    for moof in boxes.iter().filter(|b| &b.box_type == b"moof") {
        fragments += 1;
        parse_fragment(moof.content(data), &mut samples)?;
    }

    let mut random_access = Vec::new();
    let has_mfra = match boxes.last() {
        Some(last) if &last.box_type == b"mfra" => {
            let mfra = last.content(data);
            let mfro = find_box(mfra, b"mfro").ok_or_else(|| malformed("mfra without mfro"))?;
            let declared = be_u32(mfro.content(mfra), 4).ok_or_else(|| malformed("short mfro"))?;
            if declared as usize != last.size {
                return Err(malformed("mfro size does not match mfra"));
            }
            if let Some(tfra) = find_box(mfra, b"tfra") {
                random_access = parse_tfra(tfra.content(mfra))?;
            }
            true
        }
        _ => false,
    };

    Ok(Mp4Inspection {
        timescale,
        width,
        height,
        samples,
        fragments,
        random_access,
        has_mfra,
    })
}

fn parse_fragment(moof: &[u8], samples: &mut Vec<SampleInfo>) -> Result<(), MuxError> {
    let traf = find_box_path(moof, &[b"traf"]).ok_or_else(|| malformed("moof without traf"))?;
    let tfdt = find_box_path(traf, &[b"tfdt"]).ok_or_else(|| malformed("traf without tfdt"))?;
    let mut dts = match tfdt.first() {
        Some(1) => be_u64(tfdt, 4),
        _ => be_u32(tfdt, 4).map(u64::from),
    }
    .ok_or_else(|| malformed("short tfdt"))?;

    let trun = find_box_path(traf, &[b"trun"]).ok_or_else(|| malformed("traf without trun"))?;
    let flags = be_u32(trun, 0).ok_or_else(|| malformed("short trun"))? & 0x00FF_FFFF;
    let count = be_u32(trun, 4).ok_or_else(|| malformed("short trun"))?;
    let mut at = 8;
    if flags & 0x001 != 0 {
        at += 4;
    }
    let first_sample_flags = if flags & 0x004 != 0 {
        at += 4;
        be_u32(trun, at - 4)
    } else {
        None
    };

    for i in 0..count {
        let mut field = |present: u32| -> Result<Option<u32>, MuxError> {
            if flags & present == 0 {
                return Ok(None);
            }
            let v = be_u32(trun, at).ok_or_else(|| malformed("trun entry out of bounds"))?;
            at += 4;
            Ok(Some(v))
        };
        let duration = field(0x100)?.unwrap_or(0);
        let size = field(0x200)?.unwrap_or(0);
        let sample_flags = field(0x400)?
            .or(if i == 0 { first_sample_flags } else { None })
            .unwrap_or(SAMPLE_FLAGS_NON_SYNC);
        field(0x800)?;

        samples.push(SampleInfo {
            dts,
            duration,
            size,
            is_sync: sample_flags & NON_SYNC_BIT == 0,
        });
        dts += duration as u64;
    }
    Ok(())
}

fn parse_tfra(tfra: &[u8]) -> Result<Vec<RandomAccessPoint>, MuxError> {
    let version = *tfra.first().ok_or_else(|| malformed("empty tfra"))?;
    let lengths = be_u32(tfra, 8).ok_or_else(|| malformed("short tfra"))?;
    let count = be_u32(tfra, 12).ok_or_else(|| malformed("short tfra"))?;
    let numbers_len = ((lengths >> 4 & 3) + (lengths >> 2 & 3) + (lengths & 3) + 3) as usize;

    let mut at = 16;
    let mut points = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (time, moof_offset) = if version == 1 {
            let t = be_u64(tfra, at);
            let o = be_u64(tfra, at + 8);
            at += 16;
            (t, o)
        } else {
            let t = be_u32(tfra, at).map(u64::from);
            let o = be_u32(tfra, at + 4).map(u64::from);
            at += 8;
            (t, o)
        };
        let (Some(time), Some(moof_offset)) = (time, moof_offset) else {
            return Err(malformed("tfra entry out of bounds"));
        };
        at += numbers_len;
        points.push(RandomAccessPoint { time, moof_offset });
    }
    Ok(points)
}
