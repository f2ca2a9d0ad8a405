//! End-to-end self-check for the Uthernet II card.
//!
//! Drives the card through the slot interface the way Apple II
//! software would — soft switches and ROM window only — and checks
//! detection, the indirect register file, the virtual DHCP/ARP
//! responders, TCP-to-loopback redirection, and the virtual TCP
//! terminator against a real listener. Exits non-zero if any step
//! fails.
//!
//! Run with `RUST_LOG=debug` to watch the card's own view of the
//! traffic.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

use a2slot_core::{Slot, Uthernet2};

// Soft switches for slot 3.
const SW_MODE: u16 = 0xC0B4;
const SW_ADDR_HI: u16 = 0xC0B5;
const SW_ADDR_LO: u16 = 0xC0B6;
const SW_DATA: u16 = 0xC0B7;

// W5100 internal addresses.
const S0_BASE: u16 = 0x0400;
const SN_MR: u16 = 0x00;
const SN_CR: u16 = 0x01;
const SN_SR: u16 = 0x03;
const SN_DIPR: u16 = 0x0C;
const SN_DPORT: u16 = 0x10;
const SN_TX_WR: u16 = 0x24;
const SN_RX_RSR: u16 = 0x26;
const SN_RX_RD: u16 = 0x28;
const TX_BASE: u16 = 0x4000;
const RX_BASE: u16 = 0x6000;

const MODE_TCP: u8 = 0x01;
const MODE_MACRAW: u8 = 0x04;
const CMD_OPEN: u8 = 0x01;
const CMD_CONNECT: u8 = 0x04;
const CMD_CLOSE: u8 = 0x10;
const CMD_SEND: u8 = 0x20;
const CMD_RECV: u8 = 0x40;
const SR_ESTABLISHED: u8 = 0x17;
const SR_MACRAW: u8 = 0x42;

const CLIENT_MAC: [u8; 6] = [0x08, 0x00, 0x07, 0x12, 0x34, 0x56];
const CLIENT_IP: [u8; 4] = [192, 168, 65, 100];
const GATEWAY_IP: [u8; 4] = [192, 168, 65, 1];

struct Probe {
    slot: Slot<Uthernet2>,
    failures: u32,
}

impl Probe {
    fn new() -> Self {
        let slot = match Slot::new(3, Uthernet2::new()) {
            Ok(slot) => slot,
            Err(err) => {
                eprintln!("cannot install card: {}", err);
                std::process::exit(2);
            }
        };
        let mut probe = Self { slot, failures: 0 };
        probe.slot.write(SW_MODE, 0x02); // auto-increment
        probe
    }

    fn check(&mut self, name: &str, ok: bool, detail: String) {
        if ok {
            println!("PASS  {}", name);
        } else {
            println!("FAIL  {} — {}", name, detail);
            self.failures += 1;
        }
    }

    fn set_addr(&mut self, addr: u16) {
        self.slot.write(SW_ADDR_HI, (addr >> 8) as u8);
        self.slot.write(SW_ADDR_LO, addr as u8);
    }

    fn poke(&mut self, addr: u16, val: u8) {
        self.set_addr(addr);
        self.slot.write(SW_DATA, val);
    }

    fn peek(&mut self, addr: u16) -> u8 {
        self.set_addr(addr);
        self.slot.read(SW_DATA)
    }

    fn peek16(&mut self, addr: u16) -> u16 {
        ((self.peek(addr) as u16) << 8) | self.peek(addr + 1) as u16
    }

    fn read_block(&mut self, addr: u16, len: usize) -> Vec<u8> {
        self.set_addr(addr);
        (0..len).map(|_| self.slot.read(SW_DATA)).collect()
    }

    fn send_frame(&mut self, frame: &[u8]) {
        let tx_wr = self.peek16(S0_BASE + SN_TX_WR);
        self.set_addr(TX_BASE + (tx_wr.wrapping_sub(TX_BASE) & 0x07FF));
        for byte in frame {
            self.slot.write(SW_DATA, *byte);
        }
        let new_wr = tx_wr.wrapping_add(frame.len() as u16);
        self.poke(S0_BASE + SN_TX_WR, (new_wr >> 8) as u8);
        self.poke(S0_BASE + SN_TX_WR + 1, new_wr as u8);
        self.poke(S0_BASE + SN_CR, CMD_SEND);
    }

    /// Pop one length-prefixed frame off RX staging, acknowledging
    /// it with RECV. Polls briefly so host-side responses have time
    /// to arrive.
    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let mut rsr = 0;
        for _ in 0..50 {
            rsr = self.peek16(S0_BASE + SN_RX_RSR);
            if rsr > 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if rsr <= 2 {
            return None;
        }
        let head = self.peek16(S0_BASE + SN_RX_RD);
        let offset = head.wrapping_sub(RX_BASE) & 0x07FF;
        let prefix = ((self.peek(RX_BASE + offset) as u16) << 8)
            | self.peek(RX_BASE + offset + 1) as u16;
        if prefix < 2 || prefix > rsr {
            return None;
        }
        let frame = self.read_block(RX_BASE + offset + 2, prefix as usize - 2);
        let new_rd = head.wrapping_add(prefix);
        self.poke(S0_BASE + SN_RX_RD, (new_rd >> 8) as u8);
        self.poke(S0_BASE + SN_RX_RD + 1, new_rd as u8);
        self.poke(S0_BASE + SN_CR, CMD_RECV);
        Some(frame)
    }

    fn detection(&mut self) {
        let id5 = self.slot.read(0xC305);
        let id7 = self.slot.read(0xC307);
        let id0 = self.slot.read(0xC300);
        self.check(
            "detection bytes",
            id5 == 0x38 && id7 == 0x18 && id0 == 0x00,
            format!("$C305={:#04X} $C307={:#04X} $C300={:#04X}", id5, id7, id0),
        );
    }

    fn indirect_access(&mut self) {
        // Scribble over two common-register bytes, then restore the
        // reset defaults (GAR[3]=1, SUBR[0]=255).
        self.set_addr(0x0004);
        self.slot.write(SW_DATA, 0xAA);
        self.slot.write(SW_DATA, 0xBB);
        self.set_addr(0x0004);
        let a = self.slot.read(SW_DATA);
        let b = self.slot.read(SW_DATA);
        self.check(
            "indirect auto-increment",
            a == 0xAA && b == 0xBB,
            format!("read {:#04X} {:#04X}", a, b),
        );
        self.poke(0x0004, 0x01);
        self.poke(0x0005, 0xFF);
    }

    fn open_macraw(&mut self) {
        self.poke(S0_BASE + SN_MR, MODE_MACRAW);
        self.poke(S0_BASE + SN_CR, CMD_OPEN);
        let status = self.peek(S0_BASE + SN_SR);
        self.check(
            "MACRAW open",
            status == SR_MACRAW,
            format!("Sn_SR={:#04X}", status),
        );
    }

    fn dhcp_handshake(&mut self) {
        self.send_frame(&dhcp_frame(1, [0xDE, 0xAD, 0xBE, 0xEF]));
        let Some(offer) = self.take_frame() else {
            self.check("DHCP OFFER", false, "no frame staged".into());
            return;
        };
        let dhcp = &offer[14 + 20 + 8..];
        self.check(
            "DHCP OFFER",
            offer.len() >= 298
                && offer[0..6] == [0xFF; 6]
                && dhcp[0] == 2
                && dhcp[16..20] == CLIENT_IP
                && find_option(dhcp, 53) == Some(vec![2]),
            format!("{}-byte frame", offer.len()),
        );

        self.send_frame(&dhcp_frame(3, [0xDE, 0xAD, 0xBE, 0xEF]));
        let Some(ack) = self.take_frame() else {
            self.check("DHCP ACK", false, "no frame staged".into());
            return;
        };
        let dhcp = &ack[14 + 20 + 8..];
        let sipr = self.read_block(0x000F, 4);
        let gar = self.read_block(0x0001, 4);
        let subr = self.read_block(0x0005, 4);
        self.check(
            "DHCP ACK and lease commit",
            find_option(dhcp, 53) == Some(vec![5])
                && sipr == CLIENT_IP
                && gar == GATEWAY_IP
                && subr == [255, 255, 255, 0],
            format!("SIPR={:?} GAR={:?} SUBR={:?}", sipr, gar, subr),
        );
    }

    fn arp(&mut self) {
        self.send_frame(&arp_frame([10, 0, 0, 1]));
        let stray = self.peek16(S0_BASE + SN_RX_RSR);
        self.check(
            "ARP for foreign address dropped",
            stray == 0,
            format!("RSR={}", stray),
        );

        self.send_frame(&arp_frame(GATEWAY_IP));
        let Some(reply) = self.take_frame() else {
            self.check("ARP for gateway", false, "no frame staged".into());
            return;
        };
        self.check(
            "ARP for gateway",
            reply.len() == 42
                && reply[6..12] == [0x02, 0x00, 0xDE, 0xAD, 0xBE, 0x01]
                && reply[14 + 6..14 + 8] == [0x00, 0x02]
                && reply[14 + 14..14 + 18] == GATEWAY_IP,
            format!("{}-byte frame", reply.len()),
        );
    }

    /// Full virtual-TCP exchange against a real loopback echo
    /// server: SYN, handshake, data out, echoed data back, FIN.
    fn virtual_tcp(&mut self) {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => {
                self.check("virtual TCP", false, format!("cannot bind listener: {}", err));
                return;
            }
        };
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);
        let echo = std::thread::spawn(move || {
            if let Ok((mut conn, _)) = listener.accept() {
                let mut buf = [0u8; 4];
                if conn.read_exact(&mut buf).is_ok() {
                    let _ = conn.write_all(b"PONG");
                }
                std::thread::sleep(Duration::from_millis(500));
            }
        });

        self.send_frame(&tcp_frame(port, 0x02, 1000, 0, &[])); // SYN
        let Some(synack) = self.take_frame() else {
            self.check("virtual TCP SYN+ACK", false, "no frame staged".into());
            return;
        };
        let tcp = &synack[14 + 20..];
        let ok = tcp[13] == 0x12 && be32(&tcp[8..12]) == 1001;
        self.check(
            "virtual TCP SYN+ACK",
            ok,
            format!("flags={:#04X} ack={}", tcp[13], be32(&tcp[8..12])),
        );
        if !ok {
            return;
        }
        let server_seq = be32(&tcp[4..8]);

        self.send_frame(&tcp_frame(port, 0x10, 1001, server_seq + 1, &[])); // ACK
        self.send_frame(&tcp_frame(port, 0x18, 1001, server_seq + 1, b"PING"));

        let Some(ack) = self.take_frame() else {
            self.check("virtual TCP data ACK", false, "no frame staged".into());
            return;
        };
        let tcp = &ack[14 + 20..];
        self.check(
            "virtual TCP data ACK",
            tcp[13] == 0x10 && be32(&tcp[8..12]) == 1005,
            format!("flags={:#04X} ack={}", tcp[13], be32(&tcp[8..12])),
        );

        let Some(push) = self.take_frame() else {
            self.check("virtual TCP echo", false, "no PSH+ACK staged".into());
            return;
        };
        let tcp = &push[14 + 20..];
        self.check(
            "virtual TCP echo",
            tcp[13] == 0x18 && &tcp[20..] == b"PONG",
            format!("flags={:#04X} payload={:?}", tcp[13], &tcp[20..]),
        );

        self.send_frame(&tcp_frame(port, 0x11, 1005, server_seq + 5, &[])); // FIN+ACK
        let fin_ack = self.take_frame();
        let fin = self.take_frame();
        self.check(
            "virtual TCP teardown",
            fin_ack.is_some() && fin.is_some(),
            "missing ACK/FIN+ACK".into(),
        );
        let _ = echo.join();
    }

    /// Plain socket-API TCP with the 192.168.64/24 redirect.
    fn connect_redirect(&mut self) {
        let listener = match TcpListener::bind("127.0.0.1:0") {
            Ok(listener) => listener,
            Err(err) => {
                self.check("connect redirect", false, format!("bind: {}", err));
                return;
            }
        };
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(0);

        let base = S0_BASE + 0x100; // socket 1
        self.poke(base + SN_MR, MODE_TCP);
        self.poke(base + SN_CR, CMD_OPEN);
        for (i, byte) in [192u8, 168, 64, 10].iter().enumerate() {
            self.poke(base + SN_DIPR + i as u16, *byte);
        }
        self.poke(base + SN_DPORT, (port >> 8) as u8);
        self.poke(base + SN_DPORT + 1, port as u8);
        self.poke(base + SN_CR, CMD_CONNECT);

        let mut status = 0;
        for _ in 0..100 {
            status = self.peek(base + SN_SR);
            if status == SR_ESTABLISHED {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let accepted = listener.accept().is_ok();
        self.check(
            "connect redirect to loopback",
            status == SR_ESTABLISHED && accepted,
            format!("Sn_SR={:#04X} accepted={}", status, accepted),
        );
        self.poke(base + SN_CR, CMD_CLOSE);
    }
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn find_option(dhcp: &[u8], opt: u8) -> Option<Vec<u8>> {
    let mut i = 240;
    while i < dhcp.len() && dhcp[i] != 255 {
        if dhcp[i] == 0 {
            i += 1;
            continue;
        }
        let len = dhcp[i + 1] as usize;
        if dhcp[i] == opt {
            return Some(dhcp[i + 2..i + 2 + len].to_vec());
        }
        i += 2 + len;
    }
    None
}

fn dhcp_frame(message_type: u8, xid: [u8; 4]) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0xFF; 6]);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&[0x08, 0x00]);
    let ip_start = f.len();
    f.extend_from_slice(&[0x45, 0, 0, 0, 0, 0, 0, 0, 64, 17, 0, 0]);
    f.extend_from_slice(&[0, 0, 0, 0]);
    f.extend_from_slice(&[255, 255, 255, 255]);
    let udp_start = f.len();
    f.extend_from_slice(&68u16.to_be_bytes());
    f.extend_from_slice(&67u16.to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 0]);
    let dhcp_start = f.len();
    f.extend_from_slice(&[1, 1, 6, 0]);
    f.extend_from_slice(&xid);
    f.extend_from_slice(&[0u8; 20]);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&[0u8; 10]);
    f.extend_from_slice(&[0u8; 64]);
    f.extend_from_slice(&[0u8; 128]);
    f.extend_from_slice(&[99, 130, 83, 99]);
    f.extend_from_slice(&[53, 1, message_type, 255]);
    while f.len() - dhcp_start < 300 {
        f.push(0);
    }
    let udp_len = (f.len() - udp_start) as u16;
    f[udp_start + 4..udp_start + 6].copy_from_slice(&udp_len.to_be_bytes());
    let ip_len = (f.len() - ip_start) as u16;
    f[ip_start + 2..ip_start + 4].copy_from_slice(&ip_len.to_be_bytes());
    f
}

fn arp_frame(target_ip: [u8; 4]) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0xFF; 6]);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&[0x08, 0x06]);
    f.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&CLIENT_IP);
    f.extend_from_slice(&[0u8; 6]);
    f.extend_from_slice(&target_ip);
    f
}

fn tcp_frame(dst_port: u16, flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    let mut f = Vec::new();
    f.extend_from_slice(&[0x02, 0x00, 0xDE, 0xAD, 0xBE, 0x01]);
    f.extend_from_slice(&CLIENT_MAC);
    f.extend_from_slice(&[0x08, 0x00]);

    let ip_len = 20 + 20 + payload.len() as u16;
    f.extend_from_slice(&[0x45, 0x00]);
    f.extend_from_slice(&ip_len.to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 0]);
    f.extend_from_slice(&[64, 6, 0, 0]);
    f.extend_from_slice(&CLIENT_IP);
    f.extend_from_slice(&GATEWAY_IP);

    f.extend_from_slice(&4096u16.to_be_bytes());
    f.extend_from_slice(&dst_port.to_be_bytes());
    f.extend_from_slice(&seq.to_be_bytes());
    f.extend_from_slice(&ack.to_be_bytes());
    f.push(0x50);
    f.push(flags);
    f.extend_from_slice(&0x2000u16.to_be_bytes());
    f.extend_from_slice(&[0, 0, 0, 0]);
    f.extend_from_slice(payload);
    f
}

fn main() {
    env_logger::init();
    log::info!("a2slot-probe starting");

    let mut probe = Probe::new();
    probe.detection();
    probe.indirect_access();
    probe.open_macraw();
    probe.dhcp_handshake();
    probe.arp();
    probe.virtual_tcp();
    probe.connect_redirect();

    if probe.failures > 0 {
        println!("{} check(s) failed", probe.failures);
        std::process::exit(1);
    }
    println!("all checks passed");
}
