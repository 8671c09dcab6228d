#![allow(clippy::unusual_byte_groupings)]
//! Batched EVT 3.0 reader for Prophesee `.raw` recordings.
//!
//! The file starts with an optional `%`-prefixed text header carrying the
//! sensor geometry, followed by little-endian 16-bit words. Each word has a
//! 4-bit type in its MSBs; the decoder tracks time, row and vector-base state
//! across words (and across batches) to emit CD events.

use super::{unavailable, EventSource, SourceBatch, SourceError};
use crate::types::{RawEvent, Resolution};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::{debug, info, warn};

const MAX_TIMESTAMP_BASE: i64 = ((1i64 << 12) - 1) << 12; // 16773120us
const TIME_LOOP: i64 = MAX_TIMESTAMP_BASE + (1 << 12); // 16777216us
const LOOP_THRESHOLD: i64 = 10 << 12;

/// Words decoded per batch.
const BATCH_WORDS: usize = 1 << 18;

/// A decoded 16-bit EVT 3.0 word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Word {
    /// [11] system type | [10:0] y
    AddrY { y: u16 },
    /// [11] polarity | [10:0] x
    AddrX { x: u16, polarity: bool },
    /// [11] polarity | [10:0] x
    VectBaseX { x: u16, polarity: bool },
    /// [11:0] validity mask
    Vect12 { valid: u16 },
    /// [7:0] validity mask
    Vect8 { valid: u8 },
    TimeLow(u16),
    TimeHigh(u16),
    /// External triggers, continued and extension words carry no CD data.
    Ignored,
}

impl Word {
    #[inline]
    fn decode(word: u16) -> Self {
        let payload = word & 0x0FFF;
        let polarity = (word >> 11) & 0x1 == 1;
        match word >> 12 {
            0x0 => Word::AddrY { y: word & 0x07FF },
            0x2 => Word::AddrX {
                x: word & 0x07FF,
                polarity,
            },
            0x3 => Word::VectBaseX {
                x: word & 0x07FF,
                polarity,
            },
            0x4 => Word::Vect12 { valid: payload },
            0x5 => Word::Vect8 {
                valid: (word & 0x00FF) as u8,
            },
            0x6 => Word::TimeLow(payload),
            0x8 => Word::TimeHigh(payload),
            _ => Word::Ignored,
        }
    }
}

/// EVT 3.0 decoding state carried across batches.
#[derive(Debug, Default)]
pub struct Evt3Decoder {
    time_base: i64,
    current_time: i64,
    n_time_high_loops: i64,
    time_base_set: bool,

    current_y: u16,
    current_base_x: u16,
    current_polarity: bool,
}

impl Evt3Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `words`, appending CD events to `out`.
    ///
    /// Words before the first TIME_HIGH are skipped since their timestamps are
    /// unknown.
    pub fn decode_words(&mut self, words: &[u16], out: &mut Vec<RawEvent>) {
        for &raw in words {
            let word = Word::decode(raw);

            if !self.time_base_set {
                if let Word::TimeHigh(value) = word {
                    self.time_base = (value as i64) << 12;
                    self.current_time = self.time_base;
                    self.time_base_set = true;
                }
                continue;
            }

            match word {
                Word::AddrX { x, polarity } => {
                    out.push(RawEvent::new(x, self.current_y, polarity, self.current_time));
                }
                Word::Vect12 { valid } => self.emit_vector(valid as u32, 12, out),
                Word::Vect8 { valid } => self.emit_vector(valid as u32, 8, out),
                Word::AddrY { y } => self.current_y = y,
                Word::VectBaseX { x, polarity } => {
                    self.current_base_x = x;
                    self.current_polarity = polarity;
                }
                Word::TimeHigh(value) => self.advance_time_high(value),
                Word::TimeLow(value) => {
                    self.current_time = self.time_base + value as i64;
                }
                Word::Ignored => {}
            }
        }
    }

    #[inline]
    fn advance_time_high(&mut self, value: u16) {
        let mut next_base = ((value as i64) << 12) + self.n_time_high_loops * TIME_LOOP;

        // The 24-bit time counter wrapped around.
        if self.time_base > next_base
            && (self.time_base - next_base) >= (MAX_TIMESTAMP_BASE - LOOP_THRESHOLD)
        {
            next_base += TIME_LOOP;
            self.n_time_high_loops += 1;
        }

        self.time_base = next_base;
        self.current_time = next_base;
    }

    #[inline]
    fn emit_vector(&mut self, mut valid: u32, count: u16, out: &mut Vec<RawEvent>) {
        let end_x = self.current_base_x.saturating_add(count);
        for x in self.current_base_x..end_x {
            if valid & 0x1 != 0 {
                out.push(RawEvent::new(
                    x,
                    self.current_y,
                    self.current_polarity,
                    self.current_time,
                ));
            }
            valid >>= 1;
        }
        self.current_base_x = end_x;
    }
}

/// Streams CD events out of an EVT 3.0 recording one batch at a time.
pub struct Evt3Source<R = BufReader<File>> {
    reader: R,
    decoder: Evt3Decoder,
    resolution: Resolution,
    bytes: Vec<u8>,
    words: Vec<u16>,
    /// Odd trailing byte from the previous read.
    carry: Option<u8>,
    running: bool,
}

impl Evt3Source {
    /// Opens a `.raw` file and parses its header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| unavailable(path, err))?;
        let source = Self::from_reader(BufReader::new(file))?;
        info!(
            path = %path.display(),
            width = source.resolution.width,
            height = source.resolution.height,
            "opened EVT 3.0 recording"
        );
        Ok(source)
    }
}

impl<R: BufRead> Evt3Source<R> {
    /// Wraps any buffered reader positioned at the start of a recording.
    pub fn from_reader(mut reader: R) -> Result<Self, SourceError> {
        let resolution = parse_header(&mut reader)?;
        Ok(Self {
            reader,
            decoder: Evt3Decoder::new(),
            resolution,
            bytes: vec![0u8; BATCH_WORDS * 2],
            words: Vec::with_capacity(BATCH_WORDS),
            carry: None,
            running: true,
        })
    }
}

impl<R: BufRead> EventSource for Evt3Source<R> {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        let mut events = Vec::new();

        // Keep reading until a chunk yields events or the file ends, so an
        // empty batch never masquerades as end of stream.
        while self.running && events.is_empty() {
            let mut filled = 0;
            if let Some(byte) = self.carry.take() {
                self.bytes[0] = byte;
                filled = 1;
            }
            let read = self.reader.read(&mut self.bytes[filled..])?;
            if read == 0 {
                self.running = false;
                if filled == 1 {
                    debug!("dropping trailing odd byte at end of recording");
                }
                break;
            }
            filled += read;

            let even = filled & !1;
            if even < filled {
                self.carry = Some(self.bytes[even]);
            }

            self.words.resize(even / 2, 0);
            LittleEndian::read_u16_into(&self.bytes[..even], &mut self.words);
            self.decoder.decode_words(&self.words, &mut events);
        }

        if events.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SourceBatch::from_events(events)))
        }
    }
}

/// Reads `%`-prefixed header lines and returns the sensor geometry.
fn parse_header<R: BufRead>(reader: &mut R) -> Result<Resolution, SourceError> {
    let mut resolution = Resolution::default();

    loop {
        let peeked = reader.fill_buf()?;
        if peeked.first() != Some(&b'%') {
            break;
        }

        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.starts_with("% end") {
            break;
        }
        parse_header_line(line.trim_end(), &mut resolution);
    }

    Ok(resolution)
}

fn parse_header_line(line: &str, resolution: &mut Resolution) {
    if let Some(format) = line.strip_prefix("% format ") {
        // "% format EVT3;width=1280;height=720"
        for (name, value) in format.split(';').filter_map(|part| part.split_once('=')) {
            match (name, value.parse()) {
                ("width", Ok(w)) => resolution.width = w,
                ("height", Ok(h)) => resolution.height = h,
                _ => {}
            }
        }
    } else if let Some(geometry) = line.strip_prefix("% geometry ") {
        // "% geometry 1280x720"
        if let Some((w, h)) = geometry.split_once('x') {
            if let (Ok(w), Ok(h)) = (w.parse(), h.parse()) {
                resolution.width = w;
                resolution.height = h;
            }
        }
    } else if let Some(version) = line.strip_prefix("% evt ") {
        if version != "3.0" {
            warn!(version, "recording is not EVT 3.0, decoding anyway");
        }
    }
}
