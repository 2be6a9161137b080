//! Directory records and the parsers for the listing formats servers
//! actually emit: RFC 3659 fact lists, UNIX `ls -l` output and MS-DOS
//! `DIR` output. The parsers are tried in that order; a line no parser
//! recognizes is dropped from `list` results.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, Utc};

/// What kind of object a listing line describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Folder,
    Link,
}

/// One parsed directory record. Fields are filled on a best-effort
/// basis; `time` is absent when the line carried no usable timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListLineError {
    /// The line does not have this parser's shape; try the next one.
    Unsupported,
    /// The shape matched but a field would not parse.
    Invalid,
}

/// Tries the parsers in order and returns the first decisive result.
/// Only [`ListLineError::Unsupported`] falls through to the next parser.
pub(crate) fn parse_list_line(line: &str) -> Result<Entry, ListLineError> {
    for parse in [parse_rfc3659_line, parse_ls_line, parse_dir_line] {
        match parse(line) {
            Err(ListLineError::Unsupported) => continue,
            decisive => return decisive,
        }
    }
    Err(ListLineError::Unsupported)
}

/// RFC 3659 §7 style: `fact=value;fact=value; name`.
fn parse_rfc3659_line(line: &str) -> Result<Entry, ListLineError> {
    let semicolon = line.find(';');
    let space = line.find(' ');
    let (_, space) = match (semicolon, space) {
        (Some(s), Some(w)) if s < w => (s, w),
        _ => return Err(ListLineError::Unsupported),
    };

    let mut entry = Entry {
        name: line[space + 1..].to_string(),
        kind: EntryKind::File,
        size: 0,
        time: None,
    };

    for fact in line[..space - 1].split(';') {
        let Some((key, value)) = fact.split_once('=') else {
            return Err(ListLineError::Unsupported);
        };
        if key.is_empty() {
            return Err(ListLineError::Unsupported);
        }
        match key {
            "modify" => {
                let stamp = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
                    .map_err(|_| ListLineError::Invalid)?;
                entry.time = Some(stamp.and_utc());
            }
            "type" => match value {
                "dir" | "cdir" | "pdir" => entry.kind = EntryKind::Folder,
                "file" => entry.kind = EntryKind::File,
                _ => {}
            },
            "size" => {
                entry.size = value.parse().map_err(|_| ListLineError::Invalid)?;
            }
            _ => {}
        }
    }
    Ok(entry)
}

/// UNIX `ls -l` style, including the two Windows-FTPD-like variants that
/// put a `folder` marker or a zero in the second column.
fn parse_ls_line(line: &str) -> Result<Entry, ListLineError> {
    let fields: Vec<&str> = line.split_whitespace().collect();

    if fields.len() >= 7 && fields[1] == "folder" && fields[2] == "0" {
        return Ok(Entry {
            name: fields[6..].join(" "),
            kind: EntryKind::Folder,
            size: 0,
            time: Some(assemble_ls_time(&fields[3..6])?),
        });
    }

    if fields.len() >= 7 && fields[1] == "0" {
        return Ok(Entry {
            name: fields[7..].join(" "),
            kind: EntryKind::File,
            size: fields[2].parse().map_err(|_| ListLineError::Invalid)?,
            time: Some(assemble_ls_time(&fields[4..7])?),
        });
    }

    if fields.len() < 9 {
        return Err(ListLineError::Unsupported);
    }

    let (kind, size) = match fields[0].as_bytes()[0] {
        b'-' => (
            EntryKind::File,
            fields[4].parse().map_err(|_| ListLineError::Invalid)?,
        ),
        b'd' => (EntryKind::Folder, 0),
        b'l' => (EntryKind::Link, 0),
        _ => return Err(ListLineError::Unsupported),
    };

    Ok(Entry {
        name: fields[8..].join(" "),
        kind,
        size,
        time: Some(assemble_ls_time(&fields[5..8])?),
    })
}

/// Builds a timestamp from `[month, day, year-or-time]` as `ls` prints
/// it: a `HH:MM` third field means the current year, otherwise a
/// four-digit year at midnight. Everything is taken as UTC.
fn assemble_ls_time(fields: &[&str]) -> Result<DateTime<Utc>, ListLineError> {
    let (year, time) = if fields[2].contains(':') {
        (Utc::now().year().to_string(), fields[2])
    } else {
        if fields[2].len() != 4 {
            return Err(ListLineError::Invalid);
        }
        (fields[2].to_string(), "00:00")
    };
    let date = NaiveDate::parse_from_str(
        &format!("{} {} {}", fields[1], fields[0], year),
        "%d %b %Y",
    )
    .map_err(|_| ListLineError::Invalid)?;
    let time = NaiveTime::parse_from_str(time, "%H:%M").map_err(|_| ListLineError::Invalid)?;
    Ok(date.and_time(time).and_utc())
}

// Both prefixes cover exactly 17 columns.
const DIR_TIME_FORMATS: [&str; 2] = ["%m-%d-%y  %I:%M%p", "%Y-%m-%d  %H:%M"];
const DIR_TIME_WIDTH: usize = 17;

/// MS-DOS `DIR` style: a date-time prefix, then `<DIR>` or a size,
/// then the name.
fn parse_dir_line(line: &str) -> Result<Entry, ListLineError> {
    if line.len() < DIR_TIME_WIDTH || !line.is_char_boundary(DIR_TIME_WIDTH) {
        return Err(ListLineError::Unsupported);
    }
    let time = DIR_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&line[..DIR_TIME_WIDTH], format).ok())
        .ok_or(ListLineError::Unsupported)?;

    let rest = line[DIR_TIME_WIDTH..].trim_start_matches(' ');
    let (kind, size, name) = if let Some(name) = rest.strip_prefix("<DIR>") {
        (EntryKind::Folder, 0, name)
    } else {
        let space = rest.find(' ').ok_or(ListLineError::Unsupported)?;
        let size = rest[..space]
            .parse()
            .map_err(|_| ListLineError::Unsupported)?;
        (EntryKind::File, size, &rest[space..])
    };

    Ok(Entry {
        name: name.trim_start_matches(' ').to_string(),
        kind,
        size,
        time: Some(time.and_utc()),
    })
}
