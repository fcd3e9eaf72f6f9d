// Tape image codec.  Four container formats share one buffered window over
// the backing file; the window supports single-byte reads and writes in both
// directions so the drive can run forward, backward and rewind without any
// stream abstraction underneath.
//
//   TAP   little-endian length, data, pad byte on odd lengths, length again
//   E11   TAP without the pad byte
//   P7B   one byte per frame, 0x80 marks record starts, mark byte 0x97
//   AWS   6-byte header {cur_len, prev_len, flags} before each record

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::{Error, Result};

const TAPE_BUF: usize = 32 * 1024;

/// End-of-media marker in TAP/E11 images.
const TAP_EOM: u32 = 0xffff_ffff;

/// P7B tape-mark byte: the record-start bit over the mark frame.
const P7B_MARK: u8 = 0x97;

const AWS_DATA: u8 = 0x0a;
const AWS_MARK: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeFormat {
    Tap,
    E11,
    P7b,
    Aws,
}

impl TapeFormat {
    pub fn from_name(name: &str) -> Option<TapeFormat> {
        match name.to_ascii_lowercase().as_str() {
            "tap" => Some(TapeFormat::Tap),
            "e11" => Some(TapeFormat::E11),
            "p7b" => Some(TapeFormat::P7b),
            "aws" => Some(TapeFormat::Aws),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TapeFormat::Tap => "tap",
            TapeFormat::E11 => "e11",
            TapeFormat::P7b => "p7b",
            TapeFormat::Aws => "aws",
        }
    }
}

/// What the head finds when it starts moving over the next (or previous)
/// record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecStart {
    /// A data record; the length is zero when the format only discovers it
    /// frame by frame (P7B).
    Record(u32),
    Mark,
    EndOfMedia,
    Bot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecMode {
    None,
    ReadFwd,
    ReadBwd,
    Write,
}

/// Buffered random-access window over the backing file.
///
/// `position` is the file offset of `buffer[0]`, `buf_pos` the cursor within
/// the buffer, `buf_len` the valid span.  `dirty` means bytes in
/// `[position, position+buf_len)` are newer than the file; any reposition
/// outside the window flushes first.
struct Window {
    file: std::fs::File,
    buffer: Vec<u8>,
    position: u64,
    buf_pos: usize,
    buf_len: usize,
    dirty: bool,
    file_len: u64,
}

impl Window {
    fn open(name: &str) -> Result<Window> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(name)?;
        let file_len = file.metadata()?.len();
        Ok(Window {
            file,
            buffer: vec![0; TAPE_BUF],
            position: 0,
            buf_pos: 0,
            buf_len: 0,
            dirty: false,
            file_len,
        })
    }

    fn cursor(&self) -> u64 {
        self.position + self.buf_pos as u64
    }

    fn flush(&mut self) -> Result<()> {
        if self.dirty {
            self.file.seek(SeekFrom::Start(self.position))?;
            self.file.write_all(&self.buffer[..self.buf_len])?;
            self.dirty = false;
            self.file_len = self.file_len.max(self.position + self.buf_len as u64);
        }
        Ok(())
    }

    fn load(&mut self, start: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(start))?;
        let mut total = 0;
        loop {
            let n = self.file.read(&mut self.buffer[total..])?;
            if n == 0 {
                break;
            }
            total += n;
            if total == self.buffer.len() {
                break;
            }
        }
        self.position = start;
        self.buf_len = total;
        self.buf_pos = 0;
        self.dirty = false;
        Ok(())
    }

    /// Repositions the cursor, sliding (and flushing) the window as needed.
    /// Backward seeks land the target mid-window so the following byte-at-a-
    /// time walk stays cheap in either direction.
    fn seek_to(&mut self, offset: u64) -> Result<()> {
        if offset >= self.position && offset <= self.position + self.buf_len as u64 {
            self.buf_pos = (offset - self.position) as usize;
            return Ok(());
        }
        self.flush()?;
        let start = if offset < self.position {
            offset.saturating_sub((TAPE_BUF / 2) as u64)
        } else {
            offset
        };
        self.load(start)?;
        self.buf_pos = (offset - self.position) as usize;
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<u8>> {
        if self.buf_pos >= self.buf_len {
            let cursor = self.cursor();
            if cursor >= self.file_len {
                return Ok(None);
            }
            self.flush()?;
            self.load(cursor)?;
            if self.buf_len == 0 {
                return Ok(None);
            }
        }
        let b = self.buffer[self.buf_pos];
        self.buf_pos += 1;
        Ok(Some(b))
    }

    /// Reads the byte before the cursor and leaves the cursor on it.
    fn read_prev(&mut self) -> Result<Option<u8>> {
        let cursor = self.cursor();
        if cursor == 0 {
            return Ok(None);
        }
        self.seek_to(cursor - 1)?;
        let b = self.buffer[self.buf_pos];
        Ok(Some(b))
    }

    fn read_at(&mut self, offset: u64) -> Result<Option<u8>> {
        self.seek_to(offset)?;
        self.read_next()
    }

    fn write_next(&mut self, b: u8) -> Result<()> {
        if self.buf_pos >= self.buffer.len() {
            let cursor = self.cursor();
            self.flush()?;
            self.load(cursor)?;
        }
        self.buffer[self.buf_pos] = b;
        self.buf_pos += 1;
        if self.buf_pos > self.buf_len {
            self.buf_len = self.buf_pos;
        }
        self.dirty = true;
        Ok(())
    }

    /// Truncates the image at the cursor; writing a record logically erases
    /// everything behind it.
    fn truncate_here(&mut self) -> Result<()> {
        let cursor = self.cursor();
        self.buf_len = self.buf_pos;
        self.flush()?;
        self.file.set_len(cursor)?;
        self.file_len = cursor;
        Ok(())
    }
}

/// One attached tape image plus the in-progress record state.
pub struct TapeCtx {
    fmt: TapeFormat,
    file_name: Option<String>,
    window: Option<Window>,
    mode: RecMode,
    /// Record length, once known.
    lrecl: u32,
    /// Frames consumed or produced so far in the current record.
    pos_in_rec: u32,
    /// Offset of the current record's header (write, TAP/AWS reads).
    rec_start: u64,
    /// Offset of the first data byte (forward reads) or one past the last
    /// data byte (backward reads).
    data_edge: u64,
    /// Length of the record just behind the cursor, when known.  AWS needs
    /// this to walk backward from end of media.
    prev_len: Option<u32>,
    /// P7B backward read hit the record-start frame.
    bwd_done: bool,
}

impl TapeCtx {
    pub fn new(fmt: TapeFormat) -> TapeCtx {
        TapeCtx {
            fmt,
            file_name: None,
            window: None,
            mode: RecMode::None,
            lrecl: 0,
            pos_in_rec: 0,
            rec_start: 0,
            data_edge: 0,
            prev_len: None,
            bwd_done: false,
        }
    }

    pub fn set_format(&mut self, fmt: TapeFormat) {
        self.fmt = fmt;
    }

    pub fn format(&self) -> TapeFormat {
        self.fmt
    }

    pub fn attached(&self) -> bool {
        self.window.is_some()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    pub fn attach(&mut self, name: &str) -> Result<()> {
        if self.window.is_some() {
            return Err(Error::AlreadyAttached(name.to_string()));
        }
        self.window = Some(Window::open(name)?);
        self.file_name = Some(name.to_string());
        self.mode = RecMode::None;
        self.prev_len = None;
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        match self.window.take() {
            Some(mut w) => {
                w.flush()?;
                self.file_name = None;
                self.mode = RecMode::None;
                self.prev_len = None;
                Ok(())
            }
            None => Err(Error::NotAttached),
        }
    }

    pub fn at_bot(&self) -> bool {
        self.window.as_ref().map_or(true, |w| w.cursor() == 0)
    }

    pub fn position(&self) -> u64 {
        self.window.as_ref().map_or(0, |w| w.cursor())
    }

    fn win(&mut self) -> Result<&mut Window> {
        self.window.as_mut().ok_or(Error::NotAttached)
    }

    // --- writing -----------------------------------------------------------

    pub fn write_start(&mut self) -> Result<()> {
        let fmt = self.fmt;
        let prev = self.prev_len.unwrap_or(0);
        let w = self.win()?;
        let rec_start = w.cursor();
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                for _ in 0..4 {
                    w.write_next(0)?;
                }
            }
            TapeFormat::Aws => {
                write_aws_header(w, 0, prev, AWS_DATA)?;
            }
            TapeFormat::P7b => {}
        }
        self.rec_start = rec_start;
        self.mode = RecMode::Write;
        self.lrecl = 0;
        self.pos_in_rec = 0;
        Ok(())
    }

    pub fn write_frame(&mut self, byte: u8) -> Result<()> {
        if self.mode != RecMode::Write {
            return Err(Error::TapeFormat("write_frame outside a record".into()));
        }
        let fmt = self.fmt;
        let first = self.lrecl == 0;
        let w = self.win()?;
        match fmt {
            TapeFormat::P7b => {
                let mut b = byte & 0x7f;
                if first {
                    b |= 0x80;
                }
                w.write_next(b)?;
            }
            _ => w.write_next(byte)?,
        }
        self.lrecl += 1;
        Ok(())
    }

    /// Ends the record being written, or skips over the rest of the record
    /// being read.  Afterwards no record is in progress.
    pub fn finish_record(&mut self) -> Result<()> {
        match self.mode {
            RecMode::Write => self.finish_write(),
            RecMode::ReadFwd => self.finish_read_fwd(),
            RecMode::ReadBwd => self.finish_read_bwd(),
            RecMode::None => Ok(()),
        }
    }

    fn finish_write(&mut self) -> Result<()> {
        let fmt = self.fmt;
        let lrecl = self.lrecl;
        let rec_start = self.rec_start;
        let prev = self.prev_len.unwrap_or(0);
        let w = self.win()?;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                if fmt == TapeFormat::Tap && lrecl % 2 == 1 {
                    w.write_next(0)?;
                }
                for &b in lrecl.to_le_bytes().iter() {
                    w.write_next(b)?;
                }
                let end = w.cursor();
                w.seek_to(rec_start)?;
                for &b in lrecl.to_le_bytes().iter() {
                    w.write_next(b)?;
                }
                w.seek_to(end)?;
            }
            TapeFormat::Aws => {
                let end = w.cursor();
                w.seek_to(rec_start)?;
                write_aws_header(w, lrecl, prev, AWS_DATA)?;
                w.seek_to(end)?;
            }
            TapeFormat::P7b => {}
        }
        w.truncate_here()?;
        self.prev_len = Some(lrecl);
        self.mode = RecMode::None;
        Ok(())
    }

    pub fn write_mark(&mut self) -> Result<()> {
        let fmt = self.fmt;
        let prev = self.prev_len.unwrap_or(0);
        let w = self.win()?;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                for &b in 0u32.to_le_bytes().iter() {
                    w.write_next(b)?;
                }
            }
            TapeFormat::P7b => {
                w.write_next(P7B_MARK)?;
            }
            TapeFormat::Aws => {
                write_aws_header(w, 0, prev, AWS_MARK)?;
            }
        }
        w.truncate_here()?;
        self.prev_len = Some(0);
        self.mode = RecMode::None;
        Ok(())
    }

    // --- forward reading ---------------------------------------------------

    pub fn read_forward_start(&mut self) -> Result<RecStart> {
        let fmt = self.fmt;
        let w = self.win()?;
        let start = w.cursor();
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                let len = match read_le32(w)? {
                    Some(len) => len,
                    None => {
                        w.seek_to(start)?;
                        return Ok(RecStart::EndOfMedia);
                    }
                };
                if len == TAP_EOM {
                    w.seek_to(start)?;
                    return Ok(RecStart::EndOfMedia);
                }
                if len == 0 {
                    self.prev_len = Some(0);
                    return Ok(RecStart::Mark);
                }
                let lrecl = len & 0x00ff_ffff;
                let data_edge = w.cursor();
                self.rec_start = start;
                self.data_edge = data_edge;
                self.lrecl = lrecl;
                self.pos_in_rec = 0;
                self.mode = RecMode::ReadFwd;
                Ok(RecStart::Record(lrecl))
            }
            TapeFormat::Aws => {
                let hdr = match read_aws_header(w)? {
                    Some(h) => h,
                    None => {
                        w.seek_to(start)?;
                        return Ok(RecStart::EndOfMedia);
                    }
                };
                if hdr.flags & AWS_MARK != 0 {
                    self.prev_len = Some(0);
                    return Ok(RecStart::Mark);
                }
                let data_edge = w.cursor();
                self.rec_start = start;
                self.data_edge = data_edge;
                self.lrecl = hdr.cur as u32;
                self.pos_in_rec = 0;
                self.mode = RecMode::ReadFwd;
                Ok(RecStart::Record(self.lrecl))
            }
            TapeFormat::P7b => {
                let b = match w.read_next()? {
                    Some(b) => b,
                    None => return Ok(RecStart::EndOfMedia),
                };
                if b == P7B_MARK {
                    // A mark is a lone flagged frame; a data record starting
                    // with the same frame keeps unflagged frames behind it.
                    let here = w.cursor();
                    let next = w.read_next()?;
                    w.seek_to(here)?;
                    if next.map_or(true, |n| n & 0x80 != 0) {
                        self.prev_len = Some(0);
                        return Ok(RecStart::Mark);
                    }
                }
                if b & 0x80 == 0 {
                    w.seek_to(start)?;
                    return Err(Error::TapeFormat("record does not start on a boundary".into()));
                }
                w.seek_to(start)?;
                self.rec_start = start;
                self.data_edge = start;
                self.lrecl = 0;
                self.pos_in_rec = 0;
                self.mode = RecMode::ReadFwd;
                Ok(RecStart::Record(0))
            }
        }
    }

    /// Returns the next frame of the record, or `None` once the record is
    /// exhausted.
    pub fn read_frame(&mut self) -> Result<Option<u8>> {
        match self.mode {
            RecMode::ReadFwd => self.read_frame_fwd(),
            RecMode::ReadBwd => self.read_frame_bwd(),
            _ => Err(Error::TapeFormat("read_frame outside a record".into())),
        }
    }

    fn read_frame_fwd(&mut self) -> Result<Option<u8>> {
        let fmt = self.fmt;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 | TapeFormat::Aws => {
                if self.pos_in_rec >= self.lrecl {
                    return Ok(None);
                }
                let w = self.win()?;
                let b = w
                    .read_next()?
                    .ok_or_else(|| Error::TapeFormat("record truncated".into()))?;
                self.pos_in_rec += 1;
                Ok(Some(b))
            }
            TapeFormat::P7b => {
                let first = self.pos_in_rec == 0;
                let w = self.win()?;
                let here = w.cursor();
                let b = match w.read_next()? {
                    Some(b) => b,
                    None => return Ok(None),
                };
                if !first && b & 0x80 != 0 {
                    w.seek_to(here)?;
                    return Ok(None);
                }
                self.pos_in_rec += 1;
                self.lrecl = self.pos_in_rec;
                Ok(Some(b & 0x7f))
            }
        }
    }

    fn finish_read_fwd(&mut self) -> Result<()> {
        let fmt = self.fmt;
        let lrecl = self.lrecl;
        let data_edge = self.data_edge;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                let pad = if fmt == TapeFormat::Tap && lrecl % 2 == 1 { 1 } else { 0 };
                let w = self.win()?;
                w.seek_to(data_edge + lrecl as u64 + pad)?;
                let trailer = read_le32(w)?
                    .ok_or_else(|| Error::TapeFormat("missing trailing length".into()))?;
                if trailer & 0x00ff_ffff != lrecl {
                    return Err(Error::TapeFormat(format!(
                        "length mismatch: leading {} trailing {}",
                        lrecl,
                        trailer & 0x00ff_ffff
                    )));
                }
            }
            TapeFormat::Aws => {
                let w = self.win()?;
                w.seek_to(data_edge + lrecl as u64)?;
            }
            TapeFormat::P7b => {
                // Walk off the rest of the record.
                while self.read_frame_fwd()?.is_some() {}
            }
        }
        self.prev_len = Some(self.lrecl);
        self.mode = RecMode::None;
        Ok(())
    }

    // --- backward reading --------------------------------------------------

    pub fn read_backward_start(&mut self) -> Result<RecStart> {
        if self.at_bot() {
            return Ok(RecStart::Bot);
        }
        let fmt = self.fmt;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                let w = self.win()?;
                let end = w.cursor();
                if end < 4 {
                    return Err(Error::TapeFormat("truncated image".into()));
                }
                w.seek_to(end - 4)?;
                let len = read_le32(w)?
                    .ok_or_else(|| Error::TapeFormat("missing trailing length".into()))?;
                if len == TAP_EOM {
                    // End-of-media marker; step over it and look again.
                    w.seek_to(end - 4)?;
                    return self.read_backward_start();
                }
                if len == 0 {
                    w.seek_to(end - 4)?;
                    return Ok(RecStart::Mark);
                }
                let lrecl = len & 0x00ff_ffff;
                let pad = if fmt == TapeFormat::Tap && lrecl % 2 == 1 { 1 } else { 0 };
                if end < lrecl as u64 + pad + 8 {
                    return Err(Error::TapeFormat("truncated image".into()));
                }
                self.lrecl = lrecl;
                self.pos_in_rec = 0;
                self.data_edge = end - 4 - pad;
                self.rec_start = self.data_edge - lrecl as u64 - 4;
                self.mode = RecMode::ReadBwd;
                Ok(RecStart::Record(lrecl))
            }
            TapeFormat::Aws => {
                let prev = match self.prev_len {
                    Some(p) => p,
                    None => return Err(Error::TapeFormat("tape position lost".into())),
                };
                let w = self.win()?;
                let end = w.cursor();
                if end < 6 || end < prev as u64 + 6 {
                    return Err(Error::TapeFormat("truncated image".into()));
                }
                if prev == 0 {
                    // The item behind is a mark; its header carries the
                    // length of whatever lies before it.
                    w.seek_to(end - 6)?;
                    let hdr = read_aws_header(w)?
                        .ok_or_else(|| Error::TapeFormat("missing header".into()))?;
                    w.seek_to(end - 6)?;
                    self.prev_len = Some(hdr.prev as u32);
                    return Ok(RecStart::Mark);
                }
                self.lrecl = prev;
                self.pos_in_rec = 0;
                self.data_edge = end;
                self.rec_start = end - prev as u64 - 6;
                self.mode = RecMode::ReadBwd;
                Ok(RecStart::Record(prev))
            }
            TapeFormat::P7b => {
                let w = self.win()?;
                let here = w.cursor();
                let b = w
                    .read_prev()?
                    .ok_or_else(|| Error::TapeFormat("missing frame".into()))?;
                if b == P7B_MARK {
                    // Cursor already sits before the mark.
                    return Ok(RecStart::Mark);
                }
                w.seek_to(here)?;
                self.pos_in_rec = 0;
                self.lrecl = 0;
                self.bwd_done = false;
                self.mode = RecMode::ReadBwd;
                Ok(RecStart::Record(0))
            }
        }
    }

    fn read_frame_bwd(&mut self) -> Result<Option<u8>> {
        let fmt = self.fmt;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 | TapeFormat::Aws => {
                if self.pos_in_rec >= self.lrecl {
                    return Ok(None);
                }
                let off = self.data_edge - 1 - self.pos_in_rec as u64;
                let w = self.win()?;
                let b = w
                    .read_at(off)?
                    .ok_or_else(|| Error::TapeFormat("record truncated".into()))?;
                self.pos_in_rec += 1;
                Ok(Some(b))
            }
            TapeFormat::P7b => {
                if self.bwd_done {
                    return Ok(None);
                }
                let w = self.win()?;
                let b = match w.read_prev()? {
                    Some(b) => b,
                    None => {
                        self.bwd_done = true;
                        return Ok(None);
                    }
                };
                self.pos_in_rec += 1;
                self.lrecl = self.pos_in_rec;
                if b & 0x80 != 0 {
                    self.bwd_done = true;
                }
                Ok(Some(b & 0x7f))
            }
        }
    }

    fn finish_read_bwd(&mut self) -> Result<()> {
        let fmt = self.fmt;
        match fmt {
            TapeFormat::Tap | TapeFormat::E11 => {
                let rec_start = self.rec_start;
                let lrecl = self.lrecl;
                let w = self.win()?;
                w.seek_to(rec_start)?;
                let lead = read_le32(w)?
                    .ok_or_else(|| Error::TapeFormat("missing leading length".into()))?;
                if lead & 0x00ff_ffff != lrecl {
                    return Err(Error::TapeFormat(format!(
                        "length mismatch: leading {} trailing {}",
                        lead & 0x00ff_ffff,
                        lrecl
                    )));
                }
                w.seek_to(rec_start)?;
            }
            TapeFormat::Aws => {
                let rec_start = self.rec_start;
                let w = self.win()?;
                w.seek_to(rec_start)?;
                let hdr = read_aws_header(w)?
                    .ok_or_else(|| Error::TapeFormat("missing header".into()))?;
                w.seek_to(rec_start)?;
                self.prev_len = Some(hdr.prev as u32);
            }
            TapeFormat::P7b => {
                while self.read_frame_bwd()?.is_some() {}
                self.prev_len = None;
            }
        }
        if self.fmt == TapeFormat::Tap || self.fmt == TapeFormat::E11 {
            self.prev_len = None;
        }
        self.mode = RecMode::None;
        Ok(())
    }

    // --- motion ------------------------------------------------------------

    pub fn start_rewind(&mut self) -> Result<()> {
        let w = self.win()?;
        w.flush()?;
        self.mode = RecMode::None;
        Ok(())
    }

    /// Retracts up to `n` frames of tape; returns true once the load point
    /// is reached.
    pub fn rewind_frames(&mut self, n: u64) -> Result<bool> {
        let w = self.win()?;
        let target = w.cursor().saturating_sub(n);
        w.seek_to(target)?;
        self.mode = RecMode::None;
        self.prev_len = None;
        Ok(target == 0)
    }
}

struct AwsHeader {
    cur: u16,
    prev: u16,
    flags: u8,
}

fn read_le32(w: &mut Window) -> Result<Option<u32>> {
    let mut bytes = [0u8; 4];
    for (i, slot) in bytes.iter_mut().enumerate() {
        match w.read_next()? {
            Some(b) => *slot = b,
            None => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(Error::TapeFormat("truncated length word".into()));
            }
        }
    }
    Ok(Some(u32::from_le_bytes(bytes)))
}

fn read_aws_header(w: &mut Window) -> Result<Option<AwsHeader>> {
    let mut bytes = [0u8; 6];
    for (i, slot) in bytes.iter_mut().enumerate() {
        match w.read_next()? {
            Some(b) => *slot = b,
            None => {
                if i == 0 {
                    return Ok(None);
                }
                return Err(Error::TapeFormat("truncated header".into()));
            }
        }
    }
    Ok(Some(AwsHeader {
        cur: u16::from_le_bytes([bytes[0], bytes[1]]),
        prev: u16::from_le_bytes([bytes[2], bytes[3]]),
        flags: bytes[4],
    }))
}

fn write_aws_header(w: &mut Window, cur: u32, prev: u32, flags: u8) -> Result<()> {
    let cur = cur as u16;
    let prev = prev as u16;
    for &b in cur.to_le_bytes().iter() {
        w.write_next(b)?;
    }
    for &b in prev.to_le_bytes().iter() {
        w.write_next(b)?;
    }
    w.write_next(flags)?;
    w.write_next(0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn scratch() -> (NamedTempFile, String) {
        let f = NamedTempFile::new().unwrap();
        let path = f.path().to_str().unwrap().to_string();
        (f, path)
    }

    fn write_record(t: &mut TapeCtx, data: &[u8]) {
        t.write_start().unwrap();
        for &b in data {
            t.write_frame(b).unwrap();
        }
        t.finish_record().unwrap();
    }

    fn read_record_fwd(t: &mut TapeCtx) -> Option<Vec<u8>> {
        match t.read_forward_start().unwrap() {
            RecStart::Record(_) => {
                let mut v = Vec::new();
                while let Some(b) = t.read_frame().unwrap() {
                    v.push(b);
                }
                t.finish_record().unwrap();
                Some(v)
            }
            RecStart::Mark => None,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn read_record_bwd(t: &mut TapeCtx) -> Option<Vec<u8>> {
        match t.read_backward_start().unwrap() {
            RecStart::Record(_) => {
                let mut v = Vec::new();
                while let Some(b) = t.read_frame().unwrap() {
                    v.push(b);
                }
                t.finish_record().unwrap();
                v.reverse();
                Some(v)
            }
            RecStart::Mark => None,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn tap_layout_with_odd_pad() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::Tap);
        t.attach(&path).unwrap();
        write_record(&mut t, b"ABCDE");
        t.detach().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(
            bytes,
            vec![5, 0, 0, 0, b'A', b'B', b'C', b'D', b'E', 0, 5, 0, 0, 0]
        );
    }

    #[test]
    fn e11_has_no_pad() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::E11);
        t.attach(&path).unwrap();
        write_record(&mut t, b"ABCDE");
        t.detach().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![5, 0, 0, 0, b'A', b'B', b'C', b'D', b'E', 5, 0, 0, 0]);
    }

    #[test]
    fn tap_record_mark_record() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::Tap);
        t.attach(&path).unwrap();
        write_record(&mut t, b"ABCDE");
        t.write_mark().unwrap();
        write_record(&mut t, b"FG");
        assert_eq!(t.read_forward_start().unwrap(), RecStart::EndOfMedia);
        // Rewind by seeking to load point.
        t.rewind_frames(u64::MAX).unwrap();
        assert_eq!(read_record_fwd(&mut t).unwrap(), b"ABCDE");
        assert_eq!(t.read_forward_start().unwrap(), RecStart::Mark);
        assert_eq!(read_record_fwd(&mut t).unwrap(), b"FG");
        assert_eq!(t.read_forward_start().unwrap(), RecStart::EndOfMedia);
    }

    #[test]
    fn p7b_record_boundaries() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::P7b);
        t.attach(&path).unwrap();
        // BCD frames for X and Y with odd parity already applied.
        write_record(&mut t, &[0x57, 0x58]);
        t.write_mark().unwrap();
        t.detach().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, vec![0xd7, 0x58, 0x97]);
    }

    #[test]
    fn forward_backward_symmetry_all_formats() {
        for fmt in [TapeFormat::Tap, TapeFormat::E11, TapeFormat::P7b, TapeFormat::Aws].iter() {
            let (_f, path) = scratch();
            let mut t = TapeCtx::new(*fmt);
            t.attach(&path).unwrap();
            let records: Vec<Vec<u8>> =
                vec![b"FIRST".to_vec(), b"SECOND REC".to_vec(), b"Z".to_vec()];
            write_record(&mut t, &records[0]);
            write_record(&mut t, &records[1]);
            t.write_mark().unwrap();
            write_record(&mut t, &records[2]);

            // Backward from end of media: reverse sequence.
            assert_eq!(read_record_bwd(&mut t).unwrap(), records[2], "{:?}", fmt);
            assert_eq!(read_record_bwd(&mut t), None, "{:?} mark", fmt);
            assert_eq!(read_record_bwd(&mut t).unwrap(), records[1], "{:?}", fmt);
            assert_eq!(read_record_bwd(&mut t).unwrap(), records[0], "{:?}", fmt);
            assert_eq!(t.read_backward_start().unwrap(), RecStart::Bot, "{:?}", fmt);

            // Forward again: original sequence.
            assert_eq!(read_record_fwd(&mut t).unwrap(), records[0], "{:?}", fmt);
            assert_eq!(read_record_fwd(&mut t).unwrap(), records[1], "{:?}", fmt);
            assert_eq!(read_record_fwd(&mut t), None, "{:?} mark", fmt);
            assert_eq!(read_record_fwd(&mut t).unwrap(), records[2], "{:?}", fmt);
            assert_eq!(t.read_forward_start().unwrap(), RecStart::EndOfMedia, "{:?}", fmt);
        }
    }

    #[test]
    fn large_record_slides_the_window() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::Tap);
        t.attach(&path).unwrap();
        let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        write_record(&mut t, &big);
        t.rewind_frames(u64::MAX).unwrap();
        assert_eq!(read_record_fwd(&mut t).unwrap(), big);
        // And backward, which walks the window in the other direction.
        assert_eq!(read_record_bwd(&mut t).unwrap(), big);
    }

    #[test]
    fn rewind_reaches_load_point_in_steps() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::Tap);
        t.attach(&path).unwrap();
        write_record(&mut t, b"SOME DATA HERE");
        t.start_rewind().unwrap();
        let mut hops = 0;
        while !t.rewind_frames(5).unwrap() {
            hops += 1;
            assert!(hops < 100);
        }
        assert!(t.at_bot());
        assert_eq!(read_record_fwd(&mut t).unwrap(), b"SOME DATA HERE");
    }

    #[test]
    fn writing_mid_tape_erases_the_rest() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::Tap);
        t.attach(&path).unwrap();
        write_record(&mut t, b"KEEP");
        write_record(&mut t, b"DROP ME");
        t.rewind_frames(u64::MAX).unwrap();
        assert_eq!(read_record_fwd(&mut t).unwrap(), b"KEEP");
        write_record(&mut t, b"NEW");
        t.rewind_frames(u64::MAX).unwrap();
        assert_eq!(read_record_fwd(&mut t).unwrap(), b"KEEP");
        assert_eq!(read_record_fwd(&mut t).unwrap(), b"NEW");
        assert_eq!(t.read_forward_start().unwrap(), RecStart::EndOfMedia);
    }

    #[test]
    fn aws_headers_carry_previous_length() {
        let (_f, path) = scratch();
        let mut t = TapeCtx::new(TapeFormat::Aws);
        t.attach(&path).unwrap();
        write_record(&mut t, b"AAAA");
        write_record(&mut t, b"BB");
        t.detach().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..6], &[4, 0, 0, 0, AWS_DATA, 0]);
        assert_eq!(&bytes[6..10], b"AAAA");
        assert_eq!(&bytes[10..16], &[2, 0, 4, 0, AWS_DATA, 0]);
        assert_eq!(&bytes[16..18], b"BB");
    }
}
