use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use em370::bus::{master_bus, BusRx, Message};
use em370::channel::{CAW_LOC, CC0};
use em370::device::Device;
use em370::hollerith::ascii_to_ebcdic;
use em370::telnet::Listener;
use em370::terminal::{TermModel, TermRegistry};
use em370::{Configuration, Emulator};

fn put_ccw(em: &mut Emulator, at: u32, cmd: u8, addr: u32, count: u16) {
    let mem = &em.machine.mem;
    let mut m = mem.borrow_mut();
    m.write_word(CAW_LOC, at);
    m.write_word(at, ((cmd as u32) << 24) | addr);
    m.write_word(at + 4, count as u32);
}

fn wait_irq(em: &mut Emulator, dev: u16) {
    for _ in 0..10_000 {
        em.advance(100);
        if em.next_interrupt() == Some(dev) {
            return;
        }
    }
    panic!("no interrupt from {:03x}", dev);
}

#[test]
fn punch_then_read_deck_through_the_channel() {
    let deck = tempfile::NamedTempFile::new().unwrap();
    let deck_path = deck.path().to_str().unwrap().to_string();
    let config = Configuration::from_text("2540R 00C\n2540P 00D\n").unwrap();
    let mut em = Emulator::new(config).unwrap();

    let cards: Vec<String> = (0..10)
        .map(|i| {
            format!(
                "{:05} ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789",
                i
            )
        })
        .collect();

    // Punch the deck in text mode.
    {
        let punch = em.machine.chan.device(0x00d).unwrap();
        punch.borrow_mut().set_option("format", "text").unwrap();
        punch.borrow_mut().attach(&deck_path).unwrap();
    }
    for card in &cards {
        {
            let mem = &em.machine.mem;
            let mut m = mem.borrow_mut();
            for (i, ch) in card.bytes().enumerate() {
                m.write_byte(0x1000 + i as u32, ascii_to_ebcdic(ch).unwrap());
            }
        }
        put_ccw(&mut em, 0x500, 0x01, 0x1000, card.len() as u16);
        assert_eq!(em.start_io(0x00d), CC0);
        wait_irq(&mut em, 0x00d);
    }
    em.machine.chan.device(0x00d).unwrap().borrow_mut().detach().unwrap();

    // The text file carries the cards verbatim.
    let text = std::fs::read_to_string(&deck_path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), cards.len());
    for (line, card) in lines.iter().zip(cards.iter()) {
        assert_eq!(line, card);
    }

    // Read it back card by card and compare the EBCDIC images.
    em.machine.chan.device(0x00c).unwrap().borrow_mut().attach(&deck_path).unwrap();
    for card in &cards {
        put_ccw(&mut em, 0x500, 0x02, 0x2000, 80);
        assert_eq!(em.start_io(0x00c), CC0);
        wait_irq(&mut em, 0x00c);
        // Let the feed cycle finish before the next card.
        em.advance(5000);
        let mem = &em.machine.mem;
        let mut m = mem.borrow_mut();
        for (i, ch) in card.bytes().enumerate() {
            assert_eq!(
                m.read_byte(0x2000 + i as u32),
                ascii_to_ebcdic(ch).unwrap(),
                "card {:?} column {}",
                card,
                i + 1
            );
        }
        for i in card.len()..80 {
            assert_eq!(m.read_byte(0x2000 + i as u32), 0x40, "column {}", i + 1);
        }
    }
    em.shutdown();
}

#[test]
fn printer_from_configuration_prints() {
    let out = tempfile::NamedTempFile::new().unwrap();
    let out_path = out.path().to_str().unwrap().to_string();
    let config =
        Configuration::from_text(&format!("1403 00E fcb=STD1 file={}\n", out_path)).unwrap();
    let mut em = Emulator::new(config).unwrap();
    {
        let mem = &em.machine.mem;
        let mut m = mem.borrow_mut();
        for (i, ch) in "HELLO, WORLD".bytes().enumerate() {
            m.write_byte(0x1000 + i as u32, ascii_to_ebcdic(ch).unwrap());
        }
    }
    put_ccw(&mut em, 0x500, 0x01, 0x1000, 12);
    assert_eq!(em.start_io(0x00e), CC0);
    wait_irq(&mut em, 0x00e);
    em.machine.chan.device(0x00e).unwrap().borrow_mut().detach().unwrap();
    let text = std::fs::read_to_string(&out_path).unwrap();
    assert!(text.starts_with("HELLO, WORLD\n"), "got {:?}", text);
    em.shutdown();
}

// --- telnet routing ---------------------------------------------------------

const IAC: u8 = 255;
const WILL: u8 = 251;
const SB: u8 = 250;
const SE: u8 = 240;
const OPT_TTYPE: u8 = 24;

fn negotiate(stream: &mut TcpStream, term_type: &str) {
    stream.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    // Let the server's opening offer arrive, then announce the type.
    let mut scratch = [0u8; 64];
    let _ = stream.read(&mut scratch);
    stream.write_all(&[IAC, WILL, OPT_TTYPE]).unwrap();
    // Wait for SB TTYPE SEND SE.
    let mut seen = Vec::new();
    for _ in 0..50 {
        match stream.read(&mut scratch) {
            Ok(n) if n > 0 => {
                seen.extend_from_slice(&scratch[..n]);
                if seen.windows(2).any(|w| w == [OPT_TTYPE, 1]) {
                    break;
                }
            }
            _ => std::thread::sleep(Duration::from_millis(10)),
        }
    }
    let mut reply = vec![IAC, SB, OPT_TTYPE, 0];
    reply.extend_from_slice(term_type.as_bytes());
    reply.extend_from_slice(&[IAC, SE]);
    stream.write_all(&reply).unwrap();
}

fn expect_connect(rx: &BusRx) -> u16 {
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if let Ok(Message::TelConnect { dev, .. }) = rx.recv_timeout(Duration::from_millis(100)) {
            return dev;
        }
    }
    panic!("no TelConnect");
}

#[test]
fn routing_fills_group_then_rejects() {
    let registry = TermRegistry::new();
    let (tx, rx) = master_bus();
    let listener = Listener::start(0, tx, registry.clone()).unwrap();
    let port = listener.port;
    registry.register(0x010, TermModel::M3270(2), port, "tso").unwrap();
    registry.register(0x011, TermModel::M3270(2), port, "tso").unwrap();

    let mut c1 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    negotiate(&mut c1, "IBM-3278-2@tso");
    assert_eq!(expect_connect(&rx), 0x010);
    assert!(registry.in_use(0x010));

    let mut c2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    negotiate(&mut c2, "IBM-3278-2@tso");
    assert_eq!(expect_connect(&rx), 0x011);

    // Both terminals taken: the third connection is refused.
    let mut c3 = TcpStream::connect(("127.0.0.1", port)).unwrap();
    negotiate(&mut c3, "IBM-3278-2@tso");
    let mut rejected = Vec::new();
    let mut buf = [0u8; 128];
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        match c3.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => rejected.extend_from_slice(&buf[..n]),
            Err(_) => {}
        }
        if rejected.windows(11).any(|w| w == b"No matching") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&rejected);
    assert!(text.contains("No matching terminal type found"), "got {:?}", text);

    // Dropping a session frees its terminal.
    drop(c1);
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if let Ok(Message::TelDisconnect { dev }) = rx.recv_timeout(Duration::from_millis(100)) {
            assert_eq!(dev, 0x010);
            break;
        }
        if std::time::Instant::now() >= deadline {
            panic!("no TelDisconnect");
        }
    }
    assert!(!registry.in_use(0x010));

    listener.shutdown();
}

#[test]
fn line_terminals_route_by_port_scan() {
    let registry = TermRegistry::new();
    let (tx, rx) = master_bus();
    let listener = Listener::start(0, tx, registry.clone()).unwrap();
    let port = listener.port;
    registry.register(0x020, TermModel::Line, port, "").unwrap();

    let mut c = TcpStream::connect(("127.0.0.1", port)).unwrap();
    negotiate(&mut c, "VT100");
    assert_eq!(expect_connect(&rx), 0x020);
    listener.shutdown();
}

#[test]
fn configuration_serialization_survives_reparse() {
    let text = "\
2540R 00C file=deck.txt eof
1403 00E fcb=LEGACY lpp=66
2400 181 format=aws 7track noring
3270 010 group=tso model=2
";
    let config = Configuration::from_text(text).unwrap();
    for line in &config.lines {
        let again = em370::config::parse_line(&line.to_string(), line.line_no)
            .unwrap()
            .unwrap();
        assert_eq!(&again.model, &line.model);
        assert_eq!(&again.first, &line.first);
        assert_eq!(&again.options, &line.options);
    }
}
