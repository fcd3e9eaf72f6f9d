// 80-column card deck codec.  A deck is a byte stream in one of six
// interchange formats; the reader slurps the backing file and peels one
// 80-column Hollerith image per call, the punch appends encoded cards.

use std::fs::File;
use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::hollerith::{
    ebcdic_to_hol, even_parity, hol_to_ebcdic, ASCII_TO_HOL_029, HOL_TO_ASCII_029, NO_ASCII,
    NO_HOL, ODD_PARITY,
};
use crate::hollerith;

pub const CARD_COLS: usize = 80;

pub type CardImage = [u16; CARD_COLS];

// Canonical control punches: end-of-record 7-8-9, end-of-file 6-7-9,
// end-of-information 6-7-8-9.
pub const PUNCH_EOR: u16 = 0x007;
pub const PUNCH_EOF: u16 = 0x00d;
pub const PUNCH_EOI: u16 = 0x00f;

const SLURP_CHUNK: usize = 8192;
const DETECT_SPAN: usize = 160;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardMode {
    Auto,
    Text,
    Ebcdic,
    Bin,
    Octal,
    Bcd,
    Cbn,
}

impl CardMode {
    pub fn from_name(name: &str) -> Option<CardMode> {
        match name.to_ascii_lowercase().as_str() {
            "auto" => Some(CardMode::Auto),
            "text" => Some(CardMode::Text),
            "ebcdic" => Some(CardMode::Ebcdic),
            "bin" | "binary" => Some(CardMode::Bin),
            "octal" => Some(CardMode::Octal),
            "bcd" => Some(CardMode::Bcd),
            "cbn" => Some(CardMode::Cbn),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CardMode::Auto => "auto",
            CardMode::Text => "text",
            CardMode::Ebcdic => "ebcdic",
            CardMode::Bin => "bin",
            CardMode::Octal => "octal",
            CardMode::Bcd => "bcd",
            CardMode::Cbn => "cbn",
        }
    }
}

/// One card as it comes out of the hopper.  `eof` marks the end-of-file
/// card; `err` marks a column that did not translate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Card {
    pub image: CardImage,
    pub eof: bool,
    pub err: bool,
}

impl Card {
    pub fn blank() -> Card {
        Card { image: [0; CARD_COLS], eof: false, err: false }
    }

    fn eof_card() -> Card {
        let mut c = Card::blank();
        c.image[0] = PUNCH_EOF;
        c.eof = true;
        c
    }
}

/// Deck context shared by the reader and punch devices: a backing file, a
/// mode, and either an input buffer being peeled or an output stream being
/// appended to.
pub struct CardCtx {
    file_name: Option<String>,
    mode: CardMode,
    detected: Option<CardMode>,
    punch: bool,
    eof_at_end: bool,
    eof_done: bool,
    buffer: Vec<u8>,
    pos: usize,
    out: Option<File>,
}

impl CardCtx {
    pub fn new(mode: CardMode) -> CardCtx {
        CardCtx {
            file_name: None,
            mode,
            detected: None,
            punch: false,
            eof_at_end: false,
            eof_done: false,
            buffer: Vec::new(),
            pos: 0,
            out: None,
        }
    }

    pub fn set_mode(&mut self, mode: CardMode) {
        self.mode = mode;
        self.detected = None;
    }

    pub fn mode(&self) -> CardMode {
        self.mode
    }

    pub fn attached(&self) -> bool {
        self.file_name.is_some()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Attaches a deck file.  `punch` opens it for output; `eof` arranges for
    /// an end-of-file card to be presented after the last card in the file.
    pub fn attach(&mut self, file_name: &str, punch: bool, eof: bool) -> Result<()> {
        if self.file_name.is_some() {
            return Err(Error::AlreadyAttached(file_name.to_string()));
        }
        if punch {
            self.out = Some(File::create(file_name)?);
        } else {
            let mut file = File::open(file_name)?;
            self.buffer.clear();
            let mut chunk = [0u8; SLURP_CHUNK];
            loop {
                let n = file.read(&mut chunk)?;
                if n == 0 {
                    break;
                }
                self.buffer.extend_from_slice(&chunk[..n]);
            }
            self.pos = 0;
        }
        self.file_name = Some(file_name.to_string());
        self.punch = punch;
        self.eof_at_end = eof;
        self.eof_done = false;
        self.detected = None;
        Ok(())
    }

    pub fn detach(&mut self) -> Result<()> {
        if self.file_name.is_none() {
            return Err(Error::NotAttached);
        }
        if let Some(mut out) = self.out.take() {
            out.flush()?;
        }
        self.file_name = None;
        self.buffer.clear();
        self.pos = 0;
        self.detected = None;
        Ok(())
    }

    /// Cards remaining in the hopper, approximated for show commands.
    pub fn hopper_empty(&self) -> bool {
        self.pos >= self.buffer.len()
    }

    /// Peels the next card off the hopper.  `None` means the hopper is out.
    pub fn parse_card(&mut self) -> Result<Option<Card>> {
        if self.file_name.is_none() || self.punch {
            return Err(Error::NotAttached);
        }
        if self.pos >= self.buffer.len() {
            if self.eof_at_end && !self.eof_done {
                self.eof_done = true;
                return Ok(Some(Card::eof_card()));
            }
            return Ok(None);
        }
        let mode = self.resolve_read_mode();
        let card = match mode {
            CardMode::Text | CardMode::Octal => self.parse_text(),
            CardMode::Ebcdic => self.parse_ebcdic(),
            CardMode::Bin => self.parse_binary(),
            CardMode::Bcd => self.parse_bcd(),
            CardMode::Cbn => self.parse_cbn(),
            CardMode::Auto => self.parse_text(),
        }?;
        Ok(card.map(|c| {
            // A lone 6-7-9 punch reads as an end-of-file card in any format.
            if !c.eof && c.image[0] == PUNCH_EOF && c.image[1..].iter().all(|&h| h == 0) {
                Card::eof_card()
            } else {
                c
            }
        }))
    }

    /// Punches one card to the output deck.  In-memory flag bits above the
    /// 12 punch rows are stripped before anything reaches the file.
    pub fn punch_card(&mut self, image: &CardImage) -> Result<()> {
        if self.out.is_none() {
            return Err(Error::NotAttached);
        }
        let mut cols = [0u16; CARD_COLS];
        for (c, &raw) in cols.iter_mut().zip(image.iter()) {
            *c = raw & 0xfff;
        }
        let mode = match self.mode {
            CardMode::Auto => {
                if cols.iter().all(|&h| HOL_TO_ASCII_029[h as usize] != NO_ASCII) {
                    CardMode::Text
                } else {
                    CardMode::Octal
                }
            }
            m => m,
        };
        let bytes = match mode {
            CardMode::Text | CardMode::Auto => encode_text(&cols),
            CardMode::Octal => encode_octal(&cols),
            CardMode::Ebcdic => cols.iter().map(|&h| hol_to_ebcdic_byte(h)).collect(),
            CardMode::Bin => {
                let mut v = Vec::with_capacity(CARD_COLS * 2);
                for &h in cols.iter() {
                    v.push((h & 0xff) as u8);
                    v.push((h >> 8) as u8);
                }
                v
            }
            CardMode::Bcd => {
                let mut v = Vec::with_capacity(CARD_COLS);
                for (i, &h) in cols.iter().enumerate() {
                    let bcd = hollerith::hol_to_bcd(h).unwrap_or(0x10);
                    let mut b = bcd | even_parity(bcd);
                    if i == 0 {
                        b |= 0x80;
                    }
                    v.push(b);
                }
                v
            }
            CardMode::Cbn => {
                let mut v = Vec::with_capacity(CARD_COLS * 2);
                for (i, &h) in cols.iter().enumerate() {
                    let hi = ((h >> 6) & 0x3f) as u8;
                    let lo = (h & 0x3f) as u8;
                    let mut b = hi | ODD_PARITY[hi as usize];
                    if i == 0 {
                        b |= 0x80;
                    }
                    v.push(b);
                    v.push(lo | ODD_PARITY[lo as usize]);
                }
                v
            }
        };
        let out = self.out.as_mut().ok_or(Error::NotAttached)?;
        out.write_all(&bytes)?;
        Ok(())
    }

    fn resolve_read_mode(&mut self) -> CardMode {
        if self.mode != CardMode::Auto {
            return self.mode;
        }
        if let Some(m) = self.detected {
            return m;
        }
        let m = detect_mode(&self.buffer[self.pos..]);
        self.detected = Some(m);
        m
    }

    fn take_line(&mut self) -> Vec<u8> {
        let start = self.pos;
        let mut end = start;
        while end < self.buffer.len() && self.buffer[end] != b'\n' {
            end += 1;
        }
        let mut line = self.buffer[start..end].to_vec();
        self.pos = if end < self.buffer.len() { end + 1 } else { end };
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        line
    }

    fn parse_text(&mut self) -> Result<Option<Card>> {
        let line = self.take_line();
        let mut card = Card::blank();
        if line.first() == Some(&b'~') {
            let rest = &line[1..];
            if rest.iter().all(|b| b.is_ascii_whitespace()) {
                return Ok(Some(Card::eof_card()));
            }
            if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case(b"RAW") {
                let digits: Vec<u8> = rest[3..]
                    .iter()
                    .copied()
                    .filter(|b| !b.is_ascii_whitespace())
                    .collect();
                for (col, group) in digits.chunks(4).take(CARD_COLS).enumerate() {
                    let mut v: u16 = 0;
                    for &d in group {
                        if !(b'0'..=b'7').contains(&d) {
                            card.err = true;
                            v = 0;
                            break;
                        }
                        v = (v << 3) | (d - b'0') as u16;
                    }
                    card.image[col] = v & 0xfff;
                }
                return Ok(Some(card));
            }
            let word: Vec<u8> =
                rest.iter().copied().take_while(|b| !b.is_ascii_whitespace()).collect();
            match word.as_slice() {
                b"EOR" | b"eor" => {
                    card.image[0] = PUNCH_EOR;
                    return Ok(Some(card));
                }
                b"EOF" | b"eof" => {
                    return Ok(Some(Card::eof_card()));
                }
                b"EOI" | b"eoi" => {
                    card.image[0] = PUNCH_EOI;
                    return Ok(Some(card));
                }
                _ => {}
            }
        }
        let mut col = 0;
        for &b in line.iter() {
            if col >= CARD_COLS {
                break;
            }
            if b == b'\t' {
                col = (col | 7) + 1;
                continue;
            }
            let hol = if b < 0x80 { ASCII_TO_HOL_029[b as usize] } else { NO_HOL };
            if hol == NO_HOL {
                card.err = true;
                card.image[col] = 0;
            } else {
                card.image[col] = hol;
            }
            col += 1;
        }
        Ok(Some(card))
    }

    fn parse_ebcdic(&mut self) -> Result<Option<Card>> {
        let mut card = Card::blank();
        for col in 0..CARD_COLS {
            if self.pos >= self.buffer.len() {
                if col == 0 {
                    return Ok(None);
                }
                break;
            }
            card.image[col] = ebcdic_to_hol(self.buffer[self.pos]);
            self.pos += 1;
        }
        Ok(Some(card))
    }

    fn parse_binary(&mut self) -> Result<Option<Card>> {
        let mut card = Card::blank();
        for col in 0..CARD_COLS {
            if self.pos + 1 >= self.buffer.len() {
                if col == 0 {
                    return Ok(None);
                }
                card.err = true;
                self.pos = self.buffer.len();
                break;
            }
            let lo = self.buffer[self.pos] as u16;
            let hi = self.buffer[self.pos + 1] as u16;
            self.pos += 2;
            if hi & 0xf0 != 0 {
                card.err = true;
            }
            card.image[col] = (lo | (hi << 8)) & 0xfff;
        }
        Ok(Some(card))
    }

    fn parse_bcd(&mut self) -> Result<Option<Card>> {
        let mut card = Card::blank();
        for col in 0..CARD_COLS {
            if self.pos >= self.buffer.len() {
                if col == 0 {
                    return Ok(None);
                }
                break;
            }
            let mut b = self.buffer[self.pos];
            if col > 0 && b & 0x80 != 0 {
                // Start of the next record; short card.
                break;
            }
            self.pos += 1;
            b &= 0x7f;
            if b & 0x40 != even_parity(b & 0x3f) {
                card.err = true;
            }
            card.image[col] = hollerith::bcd_to_hol(b & 0x3f);
        }
        Ok(Some(card))
    }

    fn parse_cbn(&mut self) -> Result<Option<Card>> {
        let mut card = Card::blank();
        for col in 0..CARD_COLS {
            if self.pos + 1 >= self.buffer.len() {
                if col == 0 {
                    return Ok(None);
                }
                card.err = true;
                self.pos = self.buffer.len();
                break;
            }
            let hi = self.buffer[self.pos];
            let lo = self.buffer[self.pos + 1];
            if col > 0 && hi & 0x80 != 0 {
                break;
            }
            self.pos += 2;
            let hi6 = (hi & 0x3f) as u16;
            let lo6 = (lo & 0x3f) as u16;
            if hi & 0x40 != ODD_PARITY[hi6 as usize] || lo & 0x40 != ODD_PARITY[lo6 as usize] {
                card.err = true;
            }
            card.image[col] = (hi6 << 6) | lo6;
        }
        Ok(Some(card))
    }
}

fn hol_to_ebcdic_byte(hol: u16) -> u8 {
    match hol_to_ebcdic(hol) {
        Some(e) => e,
        None => 0,
    }
}

fn encode_text(cols: &CardImage) -> Vec<u8> {
    let mut line = Vec::with_capacity(CARD_COLS + 1);
    for &h in cols.iter() {
        let ch = HOL_TO_ASCII_029[h as usize];
        line.push(if ch == NO_ASCII { b'?' } else { ch });
    }
    while line.last() == Some(&b' ') {
        line.pop();
    }
    line.push(b'\n');
    line
}

fn encode_octal(cols: &CardImage) -> Vec<u8> {
    let mut line = b"~RAW".to_vec();
    let used = cols.iter().rposition(|&h| h != 0).map_or(0, |i| i + 1);
    for &h in cols[..used].iter() {
        line.extend_from_slice(format!("{:04o}", h).as_bytes());
    }
    line.push(b'\n');
    line
}

/// Guesses the on-disk format from the head of the deck: binary stores a
/// zero high nibble in every second byte, BCD and CBN set 0x80 on record
/// starts and carry per-frame parity, anything else is text.
fn detect_mode(buf: &[u8]) -> CardMode {
    let span = buf.len().min(DETECT_SPAN);
    if span == 0 {
        return CardMode::Text;
    }
    let head = &buf[..span];
    if span >= 2 && head.iter().skip(1).step_by(2).all(|&b| b < 16) {
        return CardMode::Bin;
    }
    if head[0] & 0x80 != 0 {
        let cbn_ok = span >= 2
            && head.iter().enumerate().all(|(i, &b)| {
                let v = b & 0x3f;
                let stripped = b & 0x7f;
                (i > 0 || b & 0x80 != 0) && stripped & 0x40 == ODD_PARITY[v as usize]
            });
        if cbn_ok {
            return CardMode::Cbn;
        }
        let bcd_ok = head.iter().take(CARD_COLS).all(|&b| {
            let v = b & 0x3f;
            (b & 0x7f) & 0x40 == even_parity(v)
        });
        if bcd_ok {
            return CardMode::Bcd;
        }
    }
    CardMode::Text
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn text_card(s: &str) -> CardImage {
        let mut image = [0u16; CARD_COLS];
        for (i, b) in s.bytes().enumerate() {
            image[i] = ASCII_TO_HOL_029[b as usize];
        }
        image
    }

    fn round_trip(mode: CardMode, cards: &[CardImage]) -> Vec<Card> {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let mut punch = CardCtx::new(mode);
        punch.attach(&path, true, false).unwrap();
        for c in cards {
            punch.punch_card(c).unwrap();
        }
        punch.detach().unwrap();
        let mut reader = CardCtx::new(mode);
        reader.attach(&path, false, false).unwrap();
        let mut out = Vec::new();
        while let Some(card) = reader.parse_card().unwrap() {
            out.push(card);
        }
        out
    }

    #[test]
    fn text_deck_round_trips() {
        let mut cards = Vec::new();
        for i in 0..10 {
            cards.push(text_card(&format!(
                "{:05} ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
                i
            )));
        }
        let got = round_trip(CardMode::Text, &cards);
        assert_eq!(got.len(), cards.len());
        for (g, want) in got.iter().zip(cards.iter()) {
            assert!(!g.err);
            assert_eq!(&g.image[..], &want[..]);
        }
    }

    #[test]
    fn binary_bcd_cbn_ebcdic_round_trip() {
        let mut odd = [0u16; CARD_COLS];
        for (i, c) in odd.iter_mut().enumerate() {
            // Every column a different full 12-bit pattern.
            *c = ((i as u16) * 37) & 0xfff;
        }
        for mode in [CardMode::Bin, CardMode::Cbn].iter() {
            let got = round_trip(*mode, &[odd]);
            assert_eq!(got.len(), 1, "{:?}", mode);
            assert_eq!(&got[0].image[..], &odd[..], "{:?}", mode);
        }
        // BCD and EBCDIC only carry patterns with codes in their character
        // sets, so drive them with text.
        let card = text_card("HELLO 1234 $.,-/ WORLD");
        for mode in [CardMode::Bcd, CardMode::Ebcdic].iter() {
            let got = round_trip(*mode, &[card]);
            assert_eq!(got.len(), 1, "{:?}", mode);
            assert_eq!(&got[0].image[..], &card[..], "{:?}", mode);
        }
    }

    #[test]
    fn octal_round_trips_arbitrary_patterns() {
        let mut weird = [0u16; CARD_COLS];
        weird[0] = 0xfff;
        weird[1] = 0x123;
        weird[79] = 0x801;
        let got = round_trip(CardMode::Octal, &[weird]);
        assert_eq!(got.len(), 1);
        assert_eq!(&got[0].image[..], &weird[..]);
    }

    #[test]
    fn auto_punch_picks_text_or_octal() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let mut punch = CardCtx::new(CardMode::Auto);
        punch.attach(&path, true, false).unwrap();
        punch.punch_card(&text_card("PLAIN TEXT")).unwrap();
        let mut binary = [0u16; CARD_COLS];
        binary[3] = 0xb03;
        punch.punch_card(&binary).unwrap();
        punch.detach().unwrap();
        let data = std::fs::read(&path).unwrap();
        let text = String::from_utf8(data).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("PLAIN TEXT"));
        assert!(lines.next().unwrap().starts_with("~RAW"));
    }

    #[test]
    fn tilde_controls() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        std::fs::write(&path, "~\n~EOR\n~EOI\n~RAW77770001\nABC\n").unwrap();
        let mut reader = CardCtx::new(CardMode::Text);
        reader.attach(&path, false, false).unwrap();
        let eof = reader.parse_card().unwrap().unwrap();
        assert!(eof.eof);
        let eor = reader.parse_card().unwrap().unwrap();
        assert_eq!(eor.image[0], PUNCH_EOR);
        let eoi = reader.parse_card().unwrap().unwrap();
        assert_eq!(eoi.image[0], PUNCH_EOI);
        let raw = reader.parse_card().unwrap().unwrap();
        assert_eq!(raw.image[0], 0xfff);
        assert_eq!(raw.image[1], 0x001);
        assert_eq!(raw.image[2], 0x000);
        let abc = reader.parse_card().unwrap().unwrap();
        assert_eq!(abc.image[0], ASCII_TO_HOL_029[b'A' as usize]);
        assert!(reader.parse_card().unwrap().is_none());
    }

    #[test]
    fn tabs_expand_to_next_multiple_of_eight() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        std::fs::write(&path, "A\tB\n").unwrap();
        let mut reader = CardCtx::new(CardMode::Text);
        reader.attach(&path, false, false).unwrap();
        let card = reader.parse_card().unwrap().unwrap();
        assert_eq!(card.image[0], ASCII_TO_HOL_029[b'A' as usize]);
        for col in 1..8 {
            assert_eq!(card.image[col], 0);
        }
        assert_eq!(card.image[8], ASCII_TO_HOL_029[b'B' as usize]);
    }

    #[test]
    fn auto_detect_reads_every_format() {
        let card = text_card("DETECT ME 42");
        for mode in [CardMode::Text, CardMode::Bin, CardMode::Bcd, CardMode::Cbn].iter() {
            let file = NamedTempFile::new().unwrap();
            let path = file.path().to_str().unwrap().to_string();
            let mut punch = CardCtx::new(*mode);
            punch.attach(&path, true, false).unwrap();
            punch.punch_card(&card).unwrap();
            punch.detach().unwrap();
            let mut reader = CardCtx::new(CardMode::Auto);
            reader.attach(&path, false, false).unwrap();
            let got = reader.parse_card().unwrap().unwrap();
            assert_eq!(&got.image[..], &card[..], "{:?}", mode);
        }
    }

    #[test]
    fn eof_pending_after_deck_when_requested() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        std::fs::write(&path, "LAST CARD\n").unwrap();
        let mut reader = CardCtx::new(CardMode::Text);
        reader.attach(&path, false, true).unwrap();
        assert!(!reader.parse_card().unwrap().unwrap().eof);
        let eof = reader.parse_card().unwrap().unwrap();
        assert!(eof.eof);
        assert!(reader.parse_card().unwrap().is_none());
    }

    #[test]
    fn double_attach_is_rejected() {
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        std::fs::write(&path, "").unwrap();
        let mut reader = CardCtx::new(CardMode::Text);
        reader.attach(&path, false, false).unwrap();
        assert!(reader.attach(&path, false, false).is_err());
    }
}
