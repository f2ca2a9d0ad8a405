/// Virtual TCP termination.
///
/// TCP segments the Apple II addresses at the synthetic gateway
/// subnets are terminated by the card: the payload side of the flow
/// runs on a host loopback socket, while the card speaks just enough
/// TCP back at the client for it to believe the gateway answered.
/// One flow is live at a time; a new SYN replaces the old flow.
use crate::host::{Connect, HostSocket};

use super::frame::{
    ip_checksum, read_u16, read_u32, tcp_checksum, write_u16, ETHERTYPE_IPV4, ETH_HEADER_LEN,
    ETH_SRC, IPH_CHECKSUM, IPH_DST, IPH_HEADER_LEN, IPH_LEN, IPH_SRC, IPPROTO_TCP, TCP_ACK,
    TCP_CHECKSUM, TCP_DST_PORT, TCP_FIN, TCP_FLAGS, TCP_HEADER_LEN, TCP_OFFSET, TCP_PSH, TCP_RST,
    TCP_SEQ, TCP_SRC_PORT, TCP_SYN,
};
use super::vnet::VIRTUAL_GATEWAY_MAC;
use super::w5100::W5100;

/// Fixed initial sequence number for every flow.
const INITIAL_SEQ: u32 = 12345;

/// Host responses are cut into PSH+ACK segments of at most this.
const SEGMENT_MAX: usize = 1400;

/// How long a SYN waits for the loopback connect to become writable.
const CONNECT_TIMEOUT_MS: i32 = 100;

/// How long a data segment waits for the host side to respond.
const RESPONSE_TIMEOUT_MS: i32 = 50;

#[derive(Default)]
pub(crate) struct VirtualTcp {
    pub host: Option<HostSocket>,
    pub remote_mac: [u8; 6],
    pub remote_ip: [u8; 4],
    /// The address the client dialed; replies are sourced from it.
    pub local_ip: [u8; 4],
    pub remote_port: u16,
    pub local_port: u16,
    pub our_seq: u32,
    /// Next sequence number expected from the client.
    pub their_seq: u32,
    pub established: bool,
    pub fin_sent: bool,
    pub fin_received: bool,
}

impl W5100 {
    pub(crate) fn handle_tcp(&mut self, n: usize, frame: &[u8]) {
        if frame.len() < ETH_HEADER_LEN + IPH_HEADER_LEN + TCP_HEADER_LEN {
            return;
        }
        let ip = &frame[ETH_HEADER_LEN..];
        let tcp = &ip[IPH_HEADER_LEN..];

        let src_port = read_u16(tcp, TCP_SRC_PORT);
        let dst_port = read_u16(tcp, TCP_DST_PORT);
        let flags = tcp[TCP_FLAGS];
        let header_len = ((tcp[TCP_OFFSET] >> 4) & 0x0F) as usize * 4;
        if header_len < TCP_HEADER_LEN {
            return;
        }
        let ip_total = read_u16(ip, IPH_LEN) as usize;
        let data_len = ip_total.saturating_sub(IPH_HEADER_LEN + header_len);
        let seq = read_u32(tcp, TCP_SEQ);

        log::debug!(
            "Uthernet II: TCP {}.{}.{}.{}:{} -> port {}, flags={:#04X}, seq={}, data={}",
            ip[IPH_SRC],
            ip[IPH_SRC + 1],
            ip[IPH_SRC + 2],
            ip[IPH_SRC + 3],
            src_port,
            dst_port,
            flags,
            seq,
            data_len
        );

        if flags & TCP_SYN != 0 && flags & TCP_ACK == 0 {
            self.tcp_open(n, frame, src_port, dst_port, seq);
            return;
        }

        if flags & TCP_ACK != 0 {
            if !self.vtcp.established && flags & TCP_SYN == 0 {
                log::debug!("Uthernet II: TCP handshake complete, connection established");
                self.vtcp.established = true;
            }

            if data_len > 0 {
                let data_start = ETH_HEADER_LEN + IPH_HEADER_LEN + header_len;
                let Some(data) = frame.get(data_start..data_start + data_len) else {
                    return;
                };
                log::debug!("Uthernet II: TCP received {} bytes of data", data.len());

                if let Some(host) = &self.vtcp.host {
                    match host.send(data) {
                        Ok(sent) => {
                            log::debug!("Uthernet II: TCP forwarded {} bytes to host", sent)
                        }
                        Err(err) => log::debug!("Uthernet II: TCP forward failed: {}", err),
                    }
                }

                self.vtcp.their_seq = seq.wrapping_add(data_len as u32);
                self.inject_tcp(n, TCP_ACK, &[]);
                self.pump_host_response(n);
            }
        }

        if flags & TCP_FIN != 0 {
            log::debug!("Uthernet II: TCP FIN received");
            self.vtcp.fin_received = true;
            self.vtcp.their_seq = self.vtcp.their_seq.wrapping_add(1);
            self.inject_tcp(n, TCP_ACK, &[]);

            if !self.vtcp.fin_sent {
                self.inject_tcp(n, TCP_FIN | TCP_ACK, &[]);
                self.vtcp.fin_sent = true;
                self.vtcp.our_seq = self.vtcp.our_seq.wrapping_add(1);
            }

            self.vtcp.host = None;
            self.vtcp.established = false;
        }
    }

    /// SYN: stand up the host side of the flow and answer SYN+ACK,
    /// or RST+ACK if the loopback connect fails.
    fn tcp_open(&mut self, n: usize, frame: &[u8], src_port: u16, dst_port: u16, seq: u32) {
        log::debug!(
            "Uthernet II: TCP SYN received, opening connection to localhost:{}",
            dst_port
        );

        // A new flow replaces any existing one.
        self.vtcp = VirtualTcp::default();

        let ip = &frame[ETH_HEADER_LEN..];
        self.vtcp
            .remote_mac
            .copy_from_slice(&frame[ETH_SRC..ETH_SRC + 6]);
        self.vtcp.remote_ip.copy_from_slice(&ip[IPH_SRC..IPH_SRC + 4]);
        self.vtcp.local_ip.copy_from_slice(&ip[IPH_DST..IPH_DST + 4]);
        self.vtcp.remote_port = src_port;
        self.vtcp.local_port = dst_port;
        self.vtcp.our_seq = INITIAL_SEQ;
        // The SYN occupies one sequence number.
        self.vtcp.their_seq = seq.wrapping_add(1);

        let sock = match HostSocket::stream() {
            Ok(sock) => sock,
            Err(err) => {
                log::debug!("Uthernet II: TCP socket creation failed: {}", err);
                self.inject_tcp(n, TCP_RST | TCP_ACK, &[]);
                return;
            }
        };
        let connected = match sock.connect([127, 0, 0, 1], dst_port) {
            Ok(Connect::Done) => true,
            Ok(Connect::InProgress) => {
                sock.poll_writable(CONNECT_TIMEOUT_MS) && sock.take_error().is_none()
            }
            Err(_) => false,
        };
        if !connected {
            log::debug!("Uthernet II: TCP connect to localhost:{} failed", dst_port);
            self.inject_tcp(n, TCP_RST | TCP_ACK, &[]);
            return;
        }
        self.vtcp.host = Some(sock);

        log::debug!("Uthernet II: TCP sending SYN-ACK");
        self.inject_tcp(n, TCP_SYN | TCP_ACK, &[]);
        self.vtcp.our_seq = self.vtcp.our_seq.wrapping_add(1);
    }

    /// After forwarding client data, give the host side a short
    /// window to answer and stream whatever arrives back as PSH+ACK
    /// segments.
    fn pump_host_response(&mut self, n: usize) {
        loop {
            let mut buf = [0u8; SEGMENT_MAX];
            let got = {
                let Some(host) = &self.vtcp.host else {
                    return;
                };
                if !host.poll_readable(RESPONSE_TIMEOUT_MS) {
                    return;
                }
                match host.recv(&mut buf) {
                    Ok(len) => len,
                    Err(_) => return,
                }
            };
            if got == 0 {
                log::debug!("Uthernet II: TCP host closed connection");
                self.inject_tcp(n, TCP_FIN | TCP_ACK, &[]);
                self.vtcp.fin_sent = true;
                self.vtcp.our_seq = self.vtcp.our_seq.wrapping_add(1);
                self.vtcp.host = None;
                return;
            }
            log::debug!("Uthernet II: TCP received {} bytes from host", got);
            self.inject_tcp(n, TCP_ACK | TCP_PSH, &buf[..got]);
            self.vtcp.our_seq = self.vtcp.our_seq.wrapping_add(got as u32);
        }
    }

    /// Zero-timeout poll of the host side, run on every socket-0
    /// register read while MACRAW is armed.
    pub(crate) fn virtual_tcp_poll(&mut self, n: usize) {
        if !self.vtcp.established || self.vtcp.host.is_none() {
            return;
        }
        let mut buf = [0u8; SEGMENT_MAX];
        let got = {
            let Some(host) = &self.vtcp.host else {
                return;
            };
            if !host.poll_readable(0) {
                return;
            }
            match host.recv(&mut buf) {
                Ok(len) => len,
                Err(_) => return,
            }
        };
        if got > 0 {
            log::debug!("Uthernet II: TCP received {} bytes from host (poll)", got);
            self.inject_tcp(n, TCP_ACK | TCP_PSH, &buf[..got]);
            self.vtcp.our_seq = self.vtcp.our_seq.wrapping_add(got as u32);
        } else {
            log::debug!("Uthernet II: TCP host closed connection (poll)");
            if !self.vtcp.fin_sent {
                self.inject_tcp(n, TCP_FIN | TCP_ACK, &[]);
                self.vtcp.fin_sent = true;
                self.vtcp.our_seq = self.vtcp.our_seq.wrapping_add(1);
            }
            self.vtcp.host = None;
        }
    }

    fn inject_tcp(&mut self, n: usize, flags: u8, payload: &[u8]) {
        let pkt = build_segment(&self.vtcp, flags, payload);
        if self.sockets[n].inject_frame(&pkt) {
            log::debug!(
                "Uthernet II: injected TCP response (flags={:#04X}, data={}) RX head={} tail={}",
                flags,
                payload.len(),
                self.sockets[n].rx_head,
                self.sockets[n].rx_tail
            );
        }
    }
}

fn build_segment(conn: &VirtualTcp, flags: u8, payload: &[u8]) -> Vec<u8> {
    let tcp_len = TCP_HEADER_LEN + payload.len();
    let ip_len = IPH_HEADER_LEN + tcp_len;
    let mut pkt = Vec::with_capacity(ETH_HEADER_LEN + ip_len);

    pkt.extend_from_slice(&conn.remote_mac);
    pkt.extend_from_slice(&VIRTUAL_GATEWAY_MAC);
    pkt.extend_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let ip_start = pkt.len();
    pkt.extend_from_slice(&[0x45, 0x00]);
    pkt.extend_from_slice(&(ip_len as u16).to_be_bytes());
    pkt.extend_from_slice(&[0x00, 0x01, 0x00, 0x00]); // ID, flags/fragment
    pkt.push(64); // TTL
    pkt.push(IPPROTO_TCP);
    pkt.extend_from_slice(&[0x00, 0x00]); // checksum, filled below
    pkt.extend_from_slice(&conn.local_ip);
    pkt.extend_from_slice(&conn.remote_ip);
    let checksum = ip_checksum(&pkt[ip_start..ip_start + IPH_HEADER_LEN]);
    write_u16(&mut pkt, ip_start + IPH_CHECKSUM, checksum);

    let tcp_start = pkt.len();
    pkt.extend_from_slice(&conn.local_port.to_be_bytes());
    pkt.extend_from_slice(&conn.remote_port.to_be_bytes());
    pkt.extend_from_slice(&conn.our_seq.to_be_bytes());
    pkt.extend_from_slice(&conn.their_seq.to_be_bytes());
    pkt.push(0x50); // data offset 5, no options
    pkt.push(flags);
    pkt.extend_from_slice(&0x2000u16.to_be_bytes()); // window
    pkt.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // checksum, urgent
    pkt.extend_from_slice(payload);

    let checksum = tcp_checksum(
        &pkt[ip_start..ip_start + IPH_HEADER_LEN],
        &pkt[tcp_start..],
    );
    write_u16(&mut pkt, tcp_start + TCP_CHECKSUM, checksum);

    pkt
}
