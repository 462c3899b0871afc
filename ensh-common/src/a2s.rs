// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Steam A2S_INFO server query over UDP.

use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tokio::net::UdpSocket;

pub const DEFAULT_QUERY_PORT: u16 = 27015;

const SIMPLE_HEADER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
const SPLIT_HEADER: [u8; 4] = [0xFE, 0xFF, 0xFF, 0xFF];
const INFO_REQUEST: u8 = 0x54;
const INFO_RESPONSE: u8 = 0x49;
const CHALLENGE_RESPONSE: u8 = 0x41;
const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";
const MAX_CHALLENGES: usize = 2;
const MAX_PACKET: usize = 4096;
// The Ship carries three extra bytes after the VAC flag.
const THE_SHIP_APP_ID: u16 = 2400;

const EDF_PORT: u8 = 0x80;
const EDF_STEAM_ID: u8 = 0x10;
const EDF_SPECTATOR: u8 = 0x40;
const EDF_KEYWORDS: u8 = 0x20;
const EDF_GAME_ID: u8 = 0x01;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("failed to reach game server: {0}")]
    Io(#[from] std::io::Error),
    #[error("game server did not answer within {0:?}")]
    Timeout(Duration),
    #[error("game server address {0} did not resolve")]
    Unresolved(String),
    #[error("truncated A2S packet while reading {0}")]
    Truncated(&'static str),
    #[error("unexpected A2S packet type {0:#04x}")]
    UnexpectedHeader(u8),
    #[error("split A2S responses are not supported")]
    SplitPacket,
    #[error("game server kept answering with challenges")]
    ChallengeLoop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub protocol: u8,
    pub name: String,
    pub map: String,
    pub folder: String,
    pub game: String,
    pub app_id: u16,
    pub players: u8,
    pub max_players: u8,
    pub bots: u8,
    pub server_type: char,
    pub environment: char,
    pub password_protected: bool,
    pub vac_secured: bool,
    pub version: String,
    pub port: Option<u16>,
    pub steam_id: Option<u64>,
    pub spectator_port: Option<u16>,
    pub spectator_name: Option<String>,
    pub keywords: Option<String>,
    pub game_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoAnswer {
    Info(ServerInfo),
    Challenge([u8; 4]),
}

/// Appends the port when `host` does not carry one.
pub fn query_address(host: &str, default_port: u16) -> String {
    let host = host.trim();
    let has_port = match host.rsplit_once(':') {
        Some((name, port)) => {
            !port.is_empty()
                && port.chars().all(|c| c.is_ascii_digit())
                && (!name.contains(':') || name.ends_with(']'))
        }
        None => false,
    };
    if has_port {
        host.to_string()
    } else if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{default_port}")
    } else {
        format!("{host}:{default_port}")
    }
}

pub fn info_request(challenge: Option<[u8; 4]>) -> Vec<u8> {
    let mut packet = Vec::with_capacity(SIMPLE_HEADER.len() + 1 + INFO_PAYLOAD.len() + 4);
    packet.extend_from_slice(&SIMPLE_HEADER);
    packet.push(INFO_REQUEST);
    packet.extend_from_slice(INFO_PAYLOAD);
    if let Some(challenge) = challenge {
        packet.extend_from_slice(&challenge);
    }
    packet
}

pub fn decode_info_answer(packet: &[u8]) -> Result<InfoAnswer, QueryError> {
    let mut reader = Reader::new(packet);
    let header = reader.array::<4>("header")?;
    if header == SPLIT_HEADER {
        return Err(QueryError::SplitPacket);
    }
    if header != SIMPLE_HEADER {
        return Err(QueryError::UnexpectedHeader(header[0]));
    }

    match reader.u8("packet type")? {
        CHALLENGE_RESPONSE => Ok(InfoAnswer::Challenge(reader.array::<4>("challenge")?)),
        INFO_RESPONSE => decode_info(&mut reader).map(InfoAnswer::Info),
        other => Err(QueryError::UnexpectedHeader(other)),
    }
}

fn decode_info(reader: &mut Reader<'_>) -> Result<ServerInfo, QueryError> {
    let protocol = reader.u8("protocol")?;
    let name = reader.string("name")?;
    let map = reader.string("map")?;
    let folder = reader.string("folder")?;
    let game = reader.string("game")?;
    let app_id = reader.u16("app id")?;
    let players = reader.u8("players")?;
    let max_players = reader.u8("max players")?;
    let bots = reader.u8("bots")?;
    let server_type = reader.u8("server type")? as char;
    let environment = reader.u8("environment")? as char;
    let password_protected = reader.u8("visibility")? != 0;
    let vac_secured = reader.u8("vac")? != 0;
    if app_id == THE_SHIP_APP_ID {
        reader.array::<3>("the ship fields")?;
    }
    let version = reader.string("version")?;

    let mut info = ServerInfo {
        protocol,
        name,
        map,
        folder,
        game,
        app_id,
        players,
        max_players,
        bots,
        server_type,
        environment,
        password_protected,
        vac_secured,
        version,
        port: None,
        steam_id: None,
        spectator_port: None,
        spectator_name: None,
        keywords: None,
        game_id: None,
    };

    if reader.is_empty() {
        return Ok(info);
    }
    let flags = reader.u8("extra data flag")?;
    if flags & EDF_PORT != 0 {
        info.port = Some(reader.u16("port")?);
    }
    if flags & EDF_STEAM_ID != 0 {
        info.steam_id = Some(reader.u64("steam id")?);
    }
    if flags & EDF_SPECTATOR != 0 {
        info.spectator_port = Some(reader.u16("spectator port")?);
        info.spectator_name = Some(reader.string("spectator name")?);
    }
    if flags & EDF_KEYWORDS != 0 {
        info.keywords = Some(reader.string("keywords")?);
    }
    if flags & EDF_GAME_ID != 0 {
        info.game_id = Some(reader.u64("game id")?);
    }
    Ok(info)
}

/// Sends A2S_INFO to `address` (`host:port`) and follows up to two challenge
/// round trips. Each receive waits at most `timeout`.
pub async fn query_info(address: &str, timeout: Duration) -> Result<ServerInfo, QueryError> {
    let target = tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| QueryError::Unresolved(address.to_string()))?;
    let local = if target.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(target).await?;

    let mut buf = vec![0u8; MAX_PACKET];
    let mut challenge = None;
    for _ in 0..=MAX_CHALLENGES {
        socket.send(&info_request(challenge)).await?;
        let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| QueryError::Timeout(timeout))??;
        match decode_info_answer(&buf[..len])? {
            InfoAnswer::Info(info) => return Ok(info),
            InfoAnswer::Challenge(value) => challenge = Some(value),
        }
    }
    Err(QueryError::ChallengeLoop)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], QueryError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(QueryError::Truncated(field))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], QueryError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N, field)?);
        Ok(out)
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, QueryError> {
        Ok(self.take(1, field)?[0])
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, QueryError> {
        self.array::<2>(field).map(u16::from_le_bytes)
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, QueryError> {
        self.array::<8>(field).map(u64::from_le_bytes)
    }

    fn string(&mut self, field: &'static str) -> Result<String, QueryError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let nul = rest
            .iter()
            .position(|byte| *byte == 0)
            .ok_or(QueryError::Truncated(field))?;
        let value = String::from_utf8_lossy(&rest[..nul]).into_owned();
        self.pos += nul + 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_str(packet: &mut Vec<u8>, value: &str) {
        packet.extend_from_slice(value.as_bytes());
        packet.push(0);
    }

    fn info_packet(extra: Option<(u8, Vec<u8>)>) -> Vec<u8> {
        let mut packet = SIMPLE_HEADER.to_vec();
        packet.push(INFO_RESPONSE);
        packet.push(17);
        push_str(&mut packet, "Ensh Test");
        push_str(&mut packet, "Embervale");
        push_str(&mut packet, "enshrouded");
        push_str(&mut packet, "Enshrouded");
        packet.extend_from_slice(&0u16.to_le_bytes());
        packet.extend_from_slice(&[3, 16, 0, b'd', b'w', 1, 0]);
        push_str(&mut packet, "0.7.4.0");
        if let Some((flags, bytes)) = extra {
            packet.push(flags);
            packet.extend_from_slice(&bytes);
        }
        packet
    }

    #[test]
    fn info_request_appends_challenge() {
        let plain = info_request(None);
        assert_eq!(&plain[..5], &[0xFF, 0xFF, 0xFF, 0xFF, 0x54]);
        assert!(plain.ends_with(b"Source Engine Query\0"));

        let challenged = info_request(Some([1, 2, 3, 4]));
        assert_eq!(challenged.len(), plain.len() + 4);
        assert!(challenged.ends_with(&[1, 2, 3, 4]));
    }

    #[test]
    fn decode_reads_basic_info_answer() {
        let InfoAnswer::Info(info) = decode_info_answer(&info_packet(None)).unwrap() else {
            panic!("expected info answer");
        };
        assert_eq!(info.name, "Ensh Test");
        assert_eq!(info.map, "Embervale");
        assert_eq!(info.players, 3);
        assert_eq!(info.max_players, 16);
        assert_eq!(info.server_type, 'd');
        assert_eq!(info.environment, 'w');
        assert!(info.password_protected);
        assert!(!info.vac_secured);
        assert_eq!(info.version, "0.7.4.0");
        assert_eq!(info.port, None);
    }

    #[test]
    fn decode_reads_extra_data_fields() {
        let mut extra = Vec::new();
        extra.extend_from_slice(&15637u16.to_le_bytes());
        extra.extend_from_slice(&90210u64.to_le_bytes());
        extra.extend_from_slice(b"pve,coop\0");
        let flags = EDF_PORT | EDF_STEAM_ID | EDF_KEYWORDS;

        let InfoAnswer::Info(info) =
            decode_info_answer(&info_packet(Some((flags, extra)))).unwrap()
        else {
            panic!("expected info answer");
        };
        assert_eq!(info.port, Some(15637));
        assert_eq!(info.steam_id, Some(90210));
        assert_eq!(info.keywords.as_deref(), Some("pve,coop"));
        assert_eq!(info.game_id, None);
    }

    #[test]
    fn decode_reads_challenge() {
        let packet = [0xFF, 0xFF, 0xFF, 0xFF, 0x41, 9, 8, 7, 6];
        assert_eq!(
            decode_info_answer(&packet).unwrap(),
            InfoAnswer::Challenge([9, 8, 7, 6])
        );
    }

    #[test]
    fn decode_rejects_split_and_unknown_packets() {
        assert!(matches!(
            decode_info_answer(&[0xFE, 0xFF, 0xFF, 0xFF, 0x00]),
            Err(QueryError::SplitPacket)
        ));
        assert!(matches!(
            decode_info_answer(&[0xFF, 0xFF, 0xFF, 0xFF, 0x6D]),
            Err(QueryError::UnexpectedHeader(0x6D))
        ));
    }

    #[test]
    fn decode_reports_truncated_packets() {
        let packet = info_packet(None);
        assert!(matches!(
            decode_info_answer(&packet[..12]),
            Err(QueryError::Truncated(_))
        ));
        assert!(matches!(
            decode_info_answer(&[0xFF, 0xFF]),
            Err(QueryError::Truncated("header"))
        ));
    }

    #[test]
    fn query_address_appends_default_port_only_when_missing() {
        assert_eq!(query_address("game.example.com", 15637), "game.example.com:15637");
        assert_eq!(query_address("game.example.com:27016", 15637), "game.example.com:27016");
        assert_eq!(query_address("203.0.113.5", 27015), "203.0.113.5:27015");
        assert_eq!(query_address("[2001:db8::1]:27016", 27015), "[2001:db8::1]:27016");
        assert_eq!(query_address("2001:db8::1", 27015), "[2001:db8::1]:27015");
    }

    #[tokio::test]
    async fn query_info_follows_challenge_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();
        let answer = info_packet(None);

        let fake = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], info_request(None).as_slice());
            server
                .send_to(&[0xFF, 0xFF, 0xFF, 0xFF, 0x41, 1, 2, 3, 4], peer)
                .await
                .unwrap();

            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..len], info_request(Some([1, 2, 3, 4])).as_slice());
            server.send_to(&answer, peer).await.unwrap();
        });

        let info = query_info(&address, Duration::from_secs(2)).await.unwrap();
        fake.await.unwrap();
        assert_eq!(info.name, "Ensh Test");
        assert_eq!(info.players, 3);
    }

    #[tokio::test]
    async fn query_info_times_out_on_silent_server() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = server.local_addr().unwrap().to_string();

        let err = query_info(&address, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Timeout(_)));
        drop(server);
    }
}
