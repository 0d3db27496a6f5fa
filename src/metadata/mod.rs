//! Audio file tag reading and writing.
//!
//! Uses the lofty crate for container access. Dispatch is by lowercased
//! file extension:
//!
//! | Extension       | Text tags                      | Lyrics                        | Cover                  |
//! |-----------------|--------------------------------|-------------------------------|------------------------|
//! | `.mp3`          | ID3v2 `TIT2 TPE1 TALB TYER TDAT` | `USLT` (`zho` and `eng`)    | `APIC` front cover     |
//! | `.flac`         | Vorbis `title artist album date` | `LYRICS` + `UNSYNCEDLYRICS` | `PICTURE` block        |
//! | `.m4a` / `.mp4` | `©nam ©ART ©alb ©day`          | `©lyr`                        | `covr`                 |
//!
//! Writes never clear a field that was not provided. MP3 tags are always
//! saved as ID3v2.3. An MP3 whose audio lofty cannot identify still gets its
//! ID3 block rewritten in front of the original bytes. FLAC files get a
//! trailing PADDING block before lofty touches them.
//!
//! All lofty calls block; the async [`read`] and [`write`] wrappers run them
//! on tokio's blocking pool.

use std::borrow::Cow;
use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{Datelike, NaiveDateTime};
use lofty::config::{ParseOptions, ParsingMode, WriteOptions};
use lofty::error::LoftyError;
use lofty::file::{AudioFile, TaggedFileExt};
use lofty::id3::v2::{
    AttachedPictureFrame, Frame, FrameId, Id3v2Tag, TimestampFrame, UnsynchronizedTextFrame,
};
use lofty::mpeg::MpegFile;
use lofty::picture::{MimeType, Picture, PictureType};
use lofty::probe::Probe;
use lofty::tag::items::Timestamp;
use lofty::tag::{Accessor, ItemKey, Tag, TagExt};
use lofty::TextEncoding;
use thiserror::Error;

use crate::cover::mime_from_bytes;

/// Languages written for MP3 `USLT` frames.
const USLT_LANGUAGES: [[u8; 3]; 2] = [*b"zho", *b"eng"];

/// Vorbis key that mirrors `LYRICS` for players that only read this one.
const FLAC_UNSYNCED_LYRICS: &str = "UNSYNCEDLYRICS";

/// ID3v2.3 frames that carry the recording date. lofty reads them back as `TDRC`.
const ID3_DATE_FRAMES: [&str; 3] = ["TDRC", "TYER", "TDAT"];

const FLAC_MAGIC: &[u8; 4] = b"fLaC";
const FLAC_BLOCK_PADDING: u8 = 1;
const FLAC_PADDING_LEN: usize = 1024;

/// Supported containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mp3,
    Flac,
    Mp4,
}

impl Container {
    /// Container for a path, by lowercased extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        match ext.as_str() {
            "mp3" => Some(Self::Mp3),
            "flac" => Some(Self::Flac),
            "m4a" | "mp4" => Some(Self::Mp4),
            _ => None,
        }
    }
}

/// Tags read from a file. Absent tags are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagBundle {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub date: Option<String>,
    pub lyrics: Option<String>,
}

/// A date for the `date` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagDate {
    /// Rendered as `YYYY-MM-DD`
    Timestamp(NaiveDateTime),
    /// Written as given
    Text(String),
}

impl TagDate {
    pub fn render(&self) -> String {
        match self {
            Self::Timestamp(ts) => ts.format("%Y-%m-%d").to_string(),
            Self::Text(text) => text.clone(),
        }
    }
}

/// Fields to write. `None` leaves the file's existing value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagWrite {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub date: Option<TagDate>,
    pub lyrics: Option<String>,
    /// Front cover image bytes (JPEG or PNG)
    pub cover: Option<Vec<u8>>,
}

impl TagWrite {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.artist.is_none()
            && self.album.is_none()
            && self.date.is_none()
            && self.lyrics.is_none()
            && self.cover.is_none()
    }

    /// Drop blank strings and empty cover data so they are treated as absent.
    fn non_blank(mut self) -> Self {
        fn keep(value: Option<String>) -> Option<String> {
            value.filter(|v| !v.trim().is_empty())
        }
        self.title = keep(self.title);
        self.artist = keep(self.artist);
        self.album = keep(self.album);
        self.lyrics = keep(self.lyrics);
        self.date = self.date.filter(|d| !d.render().trim().is_empty());
        self.cover = self.cover.filter(|c| !c.is_empty());
        self
    }
}

/// Tag I/O errors.
#[derive(Debug, Error)]
pub enum TagError {
    #[error("unsupported container: {}", .0.display())]
    Unsupported(PathBuf),

    #[error("file not found: {}", .0.display())]
    Missing(PathBuf),

    #[error("{}: {source}", .path.display())]
    Lofty {
        path: PathBuf,
        #[source]
        source: LoftyError,
    },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tag worker failed: {0}")]
    Join(String),
}

impl TagError {
    fn lofty(path: &Path, source: LoftyError) -> Self {
        Self::Lofty {
            path: path.to_path_buf(),
            source,
        }
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The file the error refers to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Unsupported(p) | Self::Missing(p) => Some(p),
            Self::Lofty { path, .. } | Self::Io { path, .. } => Some(path),
            Self::Join(_) => None,
        }
    }
}

fn parse_options() -> ParseOptions {
    ParseOptions::new()
        .read_properties(false)
        .parsing_mode(ParsingMode::Relaxed)
}

fn check_path(path: &Path) -> Result<Container, TagError> {
    let container =
        Container::from_path(path).ok_or_else(|| TagError::Unsupported(path.to_path_buf()))?;
    if !path.is_file() {
        return Err(TagError::Missing(path.to_path_buf()));
    }
    Ok(container)
}

// ============================================================================
// Reading
// ============================================================================

/// Read title, artist, album, date and lyrics from a file.
pub fn read_blocking(path: &Path) -> Result<TagBundle, TagError> {
    let container = check_path(path)?;

    let tagged_file = Probe::open(path)
        .map_err(|e| TagError::lofty(path, e))?
        .options(parse_options())
        .read()
        .map_err(|e| TagError::lofty(path, e))?;

    let Some(tag) = tagged_file
        .primary_tag()
        .or_else(|| tagged_file.first_tag())
    else {
        return Ok(TagBundle::default());
    };

    let item = |key: &ItemKey| clean(tag.get_string(key).map(Cow::Borrowed));

    let mut lyrics = item(&ItemKey::Lyrics);
    if lyrics.is_none() && container == Container::Flac {
        lyrics = item(&ItemKey::Unknown(FLAC_UNSYNCED_LYRICS.to_string()));
    }

    Ok(TagBundle {
        title: clean(tag.title()),
        artist: clean(tag.artist()),
        album: clean(tag.album()),
        date: item(&ItemKey::RecordingDate).or_else(|| item(&ItemKey::Year)),
        lyrics,
    })
}

fn clean(value: Option<Cow<'_, str>>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ============================================================================
// Writing
// ============================================================================

/// Write the provided fields into a file. Omitted fields are left as they are.
pub fn write_blocking(path: &Path, tags: &TagWrite) -> Result<(), TagError> {
    let container = check_path(path)?;
    let tags = tags.clone().non_blank();
    if tags.is_empty() {
        return Ok(());
    }

    match container {
        Container::Mp3 => write_mp3(path, &tags),
        Container::Flac | Container::Mp4 => write_generic(path, container, &tags),
    }?;

    tracing::debug!(target: "tags", path = %path.display(), "Tags written");
    Ok(())
}

fn front_cover(data: &[u8]) -> Picture {
    let mime = if mime_from_bytes(data) == "image/png" {
        MimeType::Png
    } else {
        MimeType::Jpeg
    };
    Picture::new_unchecked(PictureType::CoverFront, Some(mime), None, data.to_vec())
}

fn frame_id(id: &'static str) -> FrameId<'static> {
    FrameId::Valid(Cow::Borrowed(id))
}

/// MP3: edit the existing ID3v2 tag and save it as v2.3.
///
/// A broken ID3 block fails the write so its frames are never dropped. When
/// lofty cannot identify the audio, the tag is spliced in front of it instead.
fn write_mp3(path: &Path, tags: &TagWrite) -> Result<(), TagError> {
    let mut id3 = match read_id3v2(path) {
        Ok(tag) => tag,
        Err(e) => {
            let bytes = std::fs::read(path).map_err(|e| TagError::io(path, e))?;
            if id3_block_len(&bytes) > 0 {
                return Err(TagError::lofty(path, e));
            }
            tracing::warn!(
                target: "tags",
                path = %path.display(),
                error = %e,
                "MPEG stream unreadable, writing a fresh ID3 tag"
            );
            Id3v2Tag::default()
        }
    };

    if let Some(title) = &tags.title {
        id3.set_title(title.clone());
    }
    if let Some(artist) = &tags.artist {
        id3.set_artist(artist.clone());
    }
    if let Some(album) = &tags.album {
        id3.set_album(album.clone());
    }
    if let Some(timestamp) = tags.date.as_ref().and_then(recording_time) {
        for id in ID3_DATE_FRAMES {
            id3.remove(&frame_id(id)).for_each(drop);
        }
        // Split into TYER + TDAT on a v2.3 save
        id3.insert(Frame::Timestamp(TimestampFrame::new(
            frame_id("TDRC"),
            TextEncoding::Latin1,
            timestamp,
        )));
    }
    if let Some(lyrics) = &tags.lyrics {
        id3.remove(&frame_id("USLT")).for_each(drop);
        for language in USLT_LANGUAGES {
            id3.insert(Frame::UnsynchronizedText(UnsynchronizedTextFrame::new(
                TextEncoding::UTF16,
                language,
                String::new(),
                lyrics.clone(),
            )));
        }
    }
    if let Some(cover) = &tags.cover {
        id3.remove_picture_type(PictureType::CoverFront);
        id3.insert(Frame::Picture(AttachedPictureFrame::new(
            TextEncoding::Latin1,
            front_cover(cover),
        )));
    }

    let options = WriteOptions::default().use_id3v23(true);
    if let Err(e) = id3.save_to_path(path, options) {
        tracing::warn!(
            target: "tags",
            path = %path.display(),
            error = %e,
            "Audio not recognized, splicing the ID3 block in front of it"
        );
        splice_id3(path, &id3, options)?;
    }
    Ok(())
}

fn read_id3v2(path: &Path) -> Result<Id3v2Tag, LoftyError> {
    let mut file = File::open(path)?;
    let mpeg = MpegFile::read_from(&mut file, parse_options())?;
    Ok(mpeg.id3v2().cloned().unwrap_or_default())
}

/// `YYYY[-MM[-DD]]` as an ID3 timestamp. Free text keeps only a leading year.
fn recording_time(date: &TagDate) -> Option<Timestamp> {
    match date {
        TagDate::Timestamp(ts) => Some(Timestamp {
            year: u16::try_from(ts.year()).ok()?,
            month: u8::try_from(ts.month()).ok(),
            day: u8::try_from(ts.day()).ok(),
            ..Timestamp::default()
        }),
        TagDate::Text(text) => text
            .trim()
            .parse::<Timestamp>()
            .ok()
            .filter(in_range)
            .or_else(|| {
                let year = text.trim().get(..4)?.parse().ok()?;
                Some(Timestamp {
                    year,
                    ..Timestamp::default()
                })
            }),
    }
}

fn in_range(ts: &Timestamp) -> bool {
    ts.year <= 9999
        && ts.month.is_none_or(|m| (1..=12).contains(&m))
        && ts.day.is_none_or(|d| (1..=31).contains(&d))
}

/// Length of the ID3v2 block at the start of `bytes`, footer included.
fn id3_block_len(bytes: &[u8]) -> usize {
    if bytes.len() < 10 || !bytes.starts_with(b"ID3") {
        return 0;
    }
    let size = bytes[6..10]
        .iter()
        .fold(0usize, |acc, b| (acc << 7) | usize::from(b & 0x7F));
    let footer = if bytes[5] & 0x10 != 0 { 10 } else { 0 };
    (10 + size + footer).min(bytes.len())
}

/// Replace the leading ID3 block, leaving every other byte as it was.
fn splice_id3(path: &Path, id3: &Id3v2Tag, options: WriteOptions) -> Result<(), TagError> {
    let original = std::fs::read(path).map_err(|e| TagError::io(path, e))?;
    let mut bytes = Vec::with_capacity(original.len() + 1024);
    id3.dump_to(&mut bytes, options)
        .map_err(|e| TagError::lofty(path, e))?;
    bytes.extend_from_slice(&original[id3_block_len(&original)..]);
    replace_file(path, &bytes)
}

/// Write through a temp file and a rename.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), TagError> {
    let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&temp_path, bytes).map_err(|e| TagError::io(path, e))?;
    if let Err(e) = std::fs::rename(&temp_path, path) {
        let _ = std::fs::remove_file(&temp_path);
        return Err(TagError::io(path, e));
    }
    Ok(())
}

/// Append a PADDING block when the last FLAC metadata block is something else.
///
/// lofty's FLAC writer indexes out of bounds on such files.
fn ensure_flac_padding(path: &Path) -> Result<(), TagError> {
    let mut bytes = std::fs::read(path).map_err(|e| TagError::io(path, e))?;
    let Some(last) = last_flac_block(&bytes) else {
        // Malformed; lofty reports it
        return Ok(());
    };
    if bytes[last] & 0x7F == FLAC_BLOCK_PADDING {
        return Ok(());
    }

    let len = u32::from_be_bytes([0, bytes[last + 1], bytes[last + 2], bytes[last + 3]]);
    let end = last + 4 + len as usize;
    bytes[last] &= 0x7F;

    let mut padding = vec![0u8; 4 + FLAC_PADDING_LEN];
    padding[0] = 0x80 | FLAC_BLOCK_PADDING;
    padding[1..4].copy_from_slice(&(FLAC_PADDING_LEN as u32).to_be_bytes()[1..]);
    bytes.splice(end..end, padding);

    tracing::debug!(target: "tags", path = %path.display(), "Added FLAC padding block");
    replace_file(path, &bytes)
}

/// Offset of the header of the last metadata block.
fn last_flac_block(bytes: &[u8]) -> Option<usize> {
    let mut offset = id3_block_len(bytes);
    if bytes.get(offset..offset + 4)? != FLAC_MAGIC {
        return None;
    }
    offset += 4;
    loop {
        let header = bytes.get(offset..offset + 4)?;
        let len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
        if offset + 4 + len > bytes.len() {
            return None;
        }
        if header[0] & 0x80 != 0 {
            return Some(offset);
        }
        offset += 4 + len;
    }
}

/// FLAC and MP4: edit the container's primary tag through lofty's generic [`Tag`].
fn write_generic(path: &Path, container: Container, tags: &TagWrite) -> Result<(), TagError> {
    if container == Container::Flac {
        ensure_flac_padding(path)?;
    }

    let mut tagged_file = Probe::open(path)
        .map_err(|e| TagError::lofty(path, e))?
        .options(parse_options())
        .read()
        .map_err(|e| TagError::lofty(path, e))?;

    let tag_type = tagged_file.primary_tag_type();
    if tagged_file.tag(tag_type).is_none() {
        tagged_file.insert_tag(Tag::new(tag_type));
    }
    let Some(tag) = tagged_file.tag_mut(tag_type) else {
        return Err(TagError::Unsupported(path.to_path_buf()));
    };

    if let Some(title) = &tags.title {
        tag.set_title(title.clone());
    }
    if let Some(artist) = &tags.artist {
        tag.set_artist(artist.clone());
    }
    if let Some(album) = &tags.album {
        tag.set_album(album.clone());
    }
    if let Some(date) = &tags.date {
        tag.insert_text(ItemKey::RecordingDate, date.render());
    }
    if let Some(lyrics) = &tags.lyrics {
        tag.insert_text(ItemKey::Lyrics, lyrics.clone());
        if container == Container::Flac {
            tag.insert_text(
                ItemKey::Unknown(FLAC_UNSYNCED_LYRICS.to_string()),
                lyrics.clone(),
            );
        }
    }
    if let Some(cover) = &tags.cover {
        while !tag.pictures().is_empty() {
            tag.remove_picture(0);
        }
        tag.push_picture(front_cover(cover));
    }

    tag.save_to_path(path, WriteOptions::default())
        .map_err(|e| TagError::lofty(path, e))
}

// ============================================================================
// Async facade
// ============================================================================

/// Read tags on the blocking pool.
pub async fn read(path: PathBuf) -> Result<TagBundle, TagError> {
    tokio::task::spawn_blocking(move || read_blocking(&path))
        .await
        .map_err(|e| TagError::Join(e.to_string()))?
}

/// Write tags on the blocking pool.
pub async fn write(path: PathBuf, tags: TagWrite) -> Result<(), TagError> {
    tokio::task::spawn_blocking(move || write_blocking(&path, &tags))
        .await
        .map_err(|e| TagError::Join(e.to_string()))?
}

/// Front cover bytes embedded in a file, if any.
pub fn read_front_cover(path: &Path) -> Result<Option<Vec<u8>>, TagError> {
    check_path(path)?;
    let tagged_file = Probe::open(path)
        .map_err(|e| TagError::lofty(path, e))?
        .options(parse_options())
        .read()
        .map_err(|e| TagError::lofty(path, e))?;

    Ok(tagged_file
        .tags()
        .iter()
        .flat_map(|tag| tag.pictures())
        .find(|p| p.pic_type() == PictureType::CoverFront)
        .or_else(|| tagged_file.tags().iter().flat_map(|t| t.pictures()).next())
        .map(|p| p.data().to_vec()))
}
