//! Plain-text event recordings.
//!
//! One event per line as four comma-separated integers. The default column
//! order is `x,y,p,t`; an optional first line `%geometry:W,H` gives the
//! sensor resolution. Lines starting with `%` or `#` are otherwise skipped.

use super::{unavailable, EventSource, SourceBatch, SourceError};
use crate::types::{RawEvent, Resolution};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Lines read per batch.
const BATCH_LINES: usize = 65_536;

/// Column order of a CSV recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldOrder {
    /// x, y, p, t
    #[default]
    XYPT,
    /// t, x, y, p
    TXYP,
    /// x, y, t, p
    XYTP,
    /// Column position of x, y, p and t respectively.
    Custom([usize; 4]),
}

impl FieldOrder {
    /// Returns, for each of x, y, p, t, the column it is read from.
    fn columns(&self) -> [usize; 4] {
        match self {
            Self::XYPT => [0, 1, 2, 3],
            Self::TXYP => [1, 2, 3, 0],
            Self::XYTP => [0, 1, 3, 2],
            Self::Custom(columns) => *columns,
        }
    }
}

impl FromStr for FieldOrder {
    type Err = SourceError;

    /// Parses a column order like "x,y,p,t" or "t,x,y,p".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<String> = s.split(',').map(|p| p.trim().to_lowercase()).collect();
        if parts.len() != 4 {
            return Err(SourceError::InvalidFormat(
                "column order must name exactly 4 fields: x, y, p, t".to_string(),
            ));
        }

        let mut columns = [usize::MAX; 4];
        for (column, part) in parts.iter().enumerate() {
            let field = match part.as_str() {
                "x" => 0,
                "y" => 1,
                "p" | "pol" | "polarity" => 2,
                "t" | "time" | "timestamp" => 3,
                _ => {
                    return Err(SourceError::InvalidFormat(format!(
                        "unknown field: {}. Use x, y, p, t",
                        part
                    )))
                }
            };
            if columns[field] != usize::MAX {
                return Err(SourceError::InvalidFormat(format!(
                    "duplicate field: {}",
                    part
                )));
            }
            columns[field] = column;
        }

        Ok(match columns {
            [0, 1, 2, 3] => Self::XYPT,
            [1, 2, 3, 0] => Self::TXYP,
            [0, 1, 3, 2] => Self::XYTP,
            other => Self::Custom(other),
        })
    }
}

/// Reads events from a CSV recording in batches.
pub struct CsvSource<R = BufReader<File>> {
    reader: R,
    order: FieldOrder,
    resolution: Resolution,
    line: String,
    line_no: usize,
    running: bool,
}

impl CsvSource {
    /// Opens a CSV recording with the default `x,y,p,t` column order.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        Self::open_with_order(path, FieldOrder::default())
    }

    pub fn open_with_order<P: AsRef<Path>>(path: P, order: FieldOrder) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| unavailable(path, err))?;
        let source = Self::from_reader(BufReader::new(file), order)?;
        info!(path = %path.display(), ?order, "opened CSV recording");
        Ok(source)
    }
}

impl<R: BufRead> CsvSource<R> {
    pub fn from_reader(mut reader: R, order: FieldOrder) -> Result<Self, SourceError> {
        let mut resolution = Resolution::default();

        if reader.fill_buf()?.starts_with(b"%geometry:") {
            let mut header = String::new();
            reader.read_line(&mut header)?;
            resolution = parse_geometry(header.trim_end())?;
        }

        Ok(Self {
            reader,
            order,
            resolution,
            line: String::new(),
            line_no: 1,
            running: true,
        })
    }

    fn parse_line(&self, line: &str) -> Result<RawEvent, SourceError> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(SourceError::InvalidFormat(format!(
                "line {}: expected 4 fields, found {}",
                self.line_no,
                fields.len()
            )));
        }

        let [cx, cy, cp, ct] = self.order.columns();
        let bad = |what: &str| {
            SourceError::InvalidFormat(format!("line {}: invalid {}", self.line_no, what))
        };
        let x = fields[cx].parse::<u16>().map_err(|_| bad("x"))?;
        let y = fields[cy].parse::<u16>().map_err(|_| bad("y"))?;
        let polarity = match fields[cp] {
            "1" | "true" => true,
            "0" | "-1" | "false" => false,
            _ => return Err(bad("polarity")),
        };
        let timestamp = fields[ct].parse::<i64>().map_err(|_| bad("timestamp"))?;

        Ok(RawEvent::new(x, y, polarity, timestamp))
    }
}

impl<R: BufRead> EventSource for CsvSource<R> {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn next_batch(&mut self) -> Result<Option<SourceBatch>, SourceError> {
        let mut events = Vec::new();

        while self.running && events.len() < BATCH_LINES {
            self.line.clear();
            if self.reader.read_line(&mut self.line)? == 0 {
                self.running = false;
                break;
            }
            self.line_no += 1;

            let trimmed = self.line.trim();
            if trimmed.is_empty() || trimmed.starts_with('%') || trimmed.starts_with('#') {
                continue;
            }
            events.push(self.parse_line(trimmed)?);
        }

        if events.is_empty() {
            Ok(None)
        } else {
            Ok(Some(SourceBatch::from_events(events)))
        }
    }
}

/// Parses a `%geometry:W,H` line.
fn parse_geometry(line: &str) -> Result<Resolution, SourceError> {
    let invalid = || SourceError::InvalidFormat(format!("invalid geometry header: {}", line));
    let dims = line.strip_prefix("%geometry:").ok_or_else(invalid)?;
    let (w, h) = dims.split_once(',').ok_or_else(invalid)?;
    Ok(Resolution {
        width: w.trim().parse().map_err(|_| invalid())?,
        height: h.trim().parse().map_err(|_| invalid())?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_field_order_parsing() {
        assert_eq!(FieldOrder::from_str("x,y,p,t").unwrap(), FieldOrder::XYPT);
        assert_eq!(FieldOrder::from_str("t,x,y,p").unwrap(), FieldOrder::TXYP);
        assert_eq!(FieldOrder::from_str("x,y,t,p").unwrap(), FieldOrder::XYTP);
        assert_eq!(FieldOrder::from_str("X, Y, P, T").unwrap(), FieldOrder::XYPT);
        assert_eq!(
            FieldOrder::from_str("p,t,x,y").unwrap(),
            FieldOrder::Custom([2, 3, 0, 1])
        );
    }

    #[test]
    fn test_field_order_invalid() {
        assert!(FieldOrder::from_str("x,y,z,t").is_err());
        assert!(FieldOrder::from_str("x,y,p").is_err());
        assert!(FieldOrder::from_str("x,x,y,t").is_err());
    }

    #[test]
    fn test_reads_geometry_and_events() {
        let text = "%geometry:640,480\n100,200,1,12345\n# comment\n101,201,0,12346\n";
        let mut source = CsvSource::from_reader(Cursor::new(text), FieldOrder::XYPT).unwrap();
        assert_eq!(source.resolution(), Resolution { width: 640, height: 480 });

        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(
            batch.events,
            vec![
                RawEvent::new(100, 200, true, 12345),
                RawEvent::new(101, 201, false, 12346)
            ]
        );
        assert!(source.next_batch().unwrap().is_none());
    }

    #[test]
    fn test_reads_timestamp_first_order() {
        let mut source =
            CsvSource::from_reader(Cursor::new("12345,100,200,1\n"), FieldOrder::TXYP).unwrap();
        let batch = source.next_batch().unwrap().unwrap();
        assert_eq!(batch.events, vec![RawEvent::new(100, 200, true, 12345)]);
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let mut source =
            CsvSource::from_reader(Cursor::new("1,2,3\n"), FieldOrder::XYPT).unwrap();
        assert!(matches!(
            source.next_batch(),
            Err(SourceError::InvalidFormat(_))
        ));
    }
}
