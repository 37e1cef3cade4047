//! The replication session, driven directly over the PostgreSQL wire
//! protocol.
//!
//! Walsender commands (`CREATE_REPLICATION_SLOT`, `IDENTIFY_SYSTEM`,
//! `START_REPLICATION`) and the CopyBoth sub-protocol they switch into are
//! not reachable through the regular client API, so this module speaks the
//! frontend/backend protocol itself with `postgres-protocol` over a plain
//! TCP stream: startup with `replication=database`, password/MD5/SCRAM
//! authentication, simple-query commands, then CopyData frames in both
//! directions.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::Utc;
use fallible_iterator::FallibleIterator;
use postgres_protocol::authentication::{self, sasl};
use postgres_protocol::message::backend::{self, Message};
use postgres_protocol::message::frontend;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::PostgresConfig;
use crate::{Error, Result};

/// The only logical-decoding plugin whose wire format this crate understands.
pub const PLUGIN_NAME: &str = "wal2json";

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const UNIX_TO_PG_EPOCH_MICROS: i64 = 946_684_800_000_000;

/// `postgres-protocol` has no variant for this tag, so it is framed out
/// before `Message::parse` sees the buffer.
const COPY_BOTH_RESPONSE_TAG: u8 = b'W';

/// One parsed backend message, covering the CopyBothResponse gap in
/// `backend::Message`.
enum BackendMessage {
    /// The reply to START_REPLICATION; its column-format body is irrelevant
    /// here and is discarded.
    CopyBothResponse,
    Standard(Message),
}

/// A PostgreSQL connection opened in `replication=database` mode.
///
/// Owns slot lifecycle and the CopyBoth stream; the chunk contents are the
/// decoder's business, not this module's. Commands and frame reads share one
/// socket, so callers hold `&mut self` for the duration of the session.
pub struct ReplicationConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    slot_name: String,
}

impl ReplicationConnection {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        info!("Creating replication connection to PostgreSQL");

        let address = format!("{}:{}", config.host, config.port);
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let stream = timeout(connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                Error::Connection(format!(
                    "Timed out connecting to {} after {}s",
                    address, config.connect_timeout_secs
                ))
            })??;
        stream.set_nodelay(true)?;

        let mut connection = Self {
            stream,
            read_buf: BytesMut::with_capacity(8192),
            slot_name: config.slot_name.clone(),
        };
        connection.startup(config).await?;

        info!("Successfully connected to PostgreSQL in replication mode");
        Ok(connection)
    }

    async fn startup(&mut self, config: &PostgresConfig) -> Result<()> {
        let parameters = [
            ("user", config.username.as_str()),
            ("database", config.database.as_str()),
            ("replication", "database"),
            ("application_name", "wal2json-capture"),
        ];
        let mut buf = BytesMut::new();
        frontend::startup_message(parameters, &mut buf)?;
        self.send(buf).await?;

        self.authenticate(config).await?;

        loop {
            match self.read_standard().await? {
                Message::ReadyForQuery(_) => return Ok(()),
                Message::BackendKeyData(_)
                | Message::ParameterStatus(_)
                | Message::NoticeResponse(_) => {}
                Message::ErrorResponse(body) => return Err(backend_error(body)),
                _ => {
                    return Err(Error::Connection(
                        "Unexpected message during startup".to_string(),
                    ))
                }
            }
        }
    }

    async fn authenticate(&mut self, config: &PostgresConfig) -> Result<()> {
        match self.read_standard().await? {
            Message::AuthenticationOk => Ok(()),
            Message::AuthenticationCleartextPassword => {
                let mut buf = BytesMut::new();
                frontend::password_message(config.password.as_bytes(), &mut buf)?;
                self.send(buf).await?;
                self.expect_authentication_ok().await
            }
            Message::AuthenticationMd5Password(body) => {
                let hashed = authentication::md5_hash(
                    config.username.as_bytes(),
                    config.password.as_bytes(),
                    body.salt(),
                );
                let mut buf = BytesMut::new();
                frontend::password_message(hashed.as_bytes(), &mut buf)?;
                self.send(buf).await?;
                self.expect_authentication_ok().await
            }
            Message::AuthenticationSasl(body) => self.authenticate_sasl(config, body).await,
            Message::ErrorResponse(body) => Err(backend_error(body)),
            _ => Err(Error::Connection(
                "Unsupported authentication request".to_string(),
            )),
        }
    }

    async fn authenticate_sasl(
        &mut self,
        config: &PostgresConfig,
        body: backend::AuthenticationSaslBody,
    ) -> Result<()> {
        let mut has_scram = false;
        let mut mechanisms = body.mechanisms();
        while let Some(mechanism) = mechanisms.next()? {
            if mechanism == sasl::SCRAM_SHA_256 {
                has_scram = true;
            }
        }
        if !has_scram {
            return Err(Error::Connection(
                "Server offers no supported SASL mechanism".to_string(),
            ));
        }

        let mut scram = sasl::ScramSha256::new(
            config.password.as_bytes(),
            sasl::ChannelBinding::unsupported(),
        );

        let mut buf = BytesMut::new();
        frontend::sasl_initial_response(sasl::SCRAM_SHA_256, scram.message(), &mut buf)?;
        self.send(buf).await?;

        let continuation = match self.read_standard().await? {
            Message::AuthenticationSaslContinue(body) => body,
            Message::ErrorResponse(body) => return Err(backend_error(body)),
            _ => {
                return Err(Error::Connection(
                    "Expected SASL continuation".to_string(),
                ))
            }
        };
        scram.update(continuation.data())?;

        let mut buf = BytesMut::new();
        frontend::sasl_response(scram.message(), &mut buf)?;
        self.send(buf).await?;

        let finalization = match self.read_standard().await? {
            Message::AuthenticationSaslFinal(body) => body,
            Message::ErrorResponse(body) => return Err(backend_error(body)),
            _ => {
                return Err(Error::Connection(
                    "Expected SASL finalization".to_string(),
                ))
            }
        };
        scram.finish(finalization.data())?;

        self.expect_authentication_ok().await
    }

    async fn expect_authentication_ok(&mut self) -> Result<()> {
        match self.read_standard().await? {
            Message::AuthenticationOk => Ok(()),
            Message::ErrorResponse(body) => Err(backend_error(body)),
            _ => Err(Error::Connection(
                "Expected authentication confirmation".to_string(),
            )),
        }
    }

    pub async fn create_replication_slot(&mut self) -> Result<()> {
        info!(
            "Creating replication slot: {} (plugin {})",
            self.slot_name, PLUGIN_NAME
        );

        let query = format!(
            "CREATE_REPLICATION_SLOT {} LOGICAL {} NOEXPORT_SNAPSHOT",
            self.slot_name, PLUGIN_NAME
        );

        match self.simple_command(&query).await {
            Ok(rows) => {
                if let Some(row) = rows.first() {
                    let slot = value_at(row, 0).unwrap_or("unknown");
                    let lsn = value_at(row, 1).unwrap_or("unknown");
                    info!("Created replication slot '{}' at LSN {}", slot, lsn);
                }
                Ok(())
            }
            // 42710 duplicate_object: the slot survived a previous run.
            Err(e) if e.to_string().contains("42710") => {
                info!("Replication slot '{}' already exists", self.slot_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn drop_replication_slot(&mut self) -> Result<()> {
        info!("Dropping replication slot: {}", self.slot_name);

        let query = format!("DROP_REPLICATION_SLOT {}", self.slot_name);

        match self.simple_command(&query).await {
            Ok(_) => Ok(()),
            // 42704 undefined_object: nothing to drop.
            Err(e) if e.to_string().contains("42704") => {
                warn!("Replication slot '{}' does not exist", self.slot_name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn identify_system(&mut self) -> Result<SystemInfo> {
        debug!("Sending IDENTIFY_SYSTEM command");

        let rows = self.simple_command("IDENTIFY_SYSTEM").await?;
        let row = rows.first().ok_or_else(|| Error::Replication {
            message: "Failed to get system info".to_string(),
        })?;

        let info = SystemInfo {
            system_id: value_at(row, 0).unwrap_or("unknown").to_string(),
            timeline: value_at(row, 1).and_then(|v| v.parse().ok()).unwrap_or(1),
            xlogpos: value_at(row, 2).unwrap_or("0/0").to_string(),
            dbname: value_at(row, 3).map(|s| s.to_string()),
        };
        debug!("System info: {:?}", info);
        Ok(info)
    }

    /// Switches the session into CopyBoth mode with the negotiated wal2json
    /// options. Frames are pulled with [`recv_frame`](Self::recv_frame)
    /// afterwards.
    pub async fn start_replication(
        &mut self,
        start_lsn: u64,
        include_metadata: bool,
        tables: &[String],
    ) -> Result<()> {
        let options = stream_options(include_metadata, tables)
            .into_iter()
            .map(|(name, value)| format!("\"{}\" '{}'", name, value))
            .collect::<Vec<_>>()
            .join(", ");

        let query = format!(
            "START_REPLICATION SLOT {} LOGICAL {} ({})",
            self.slot_name,
            format_lsn(start_lsn),
            options
        );

        info!("Starting replication from LSN: {}", format_lsn(start_lsn));
        debug!("Replication command: {}", query);

        let mut buf = BytesMut::new();
        frontend::query(&query, &mut buf)?;
        self.send(buf).await?;

        loop {
            match self.read_message().await? {
                BackendMessage::CopyBothResponse => return Ok(()),
                BackendMessage::Standard(Message::NoticeResponse(_))
                | BackendMessage::Standard(Message::ParameterStatus(_)) => {}
                BackendMessage::Standard(Message::ErrorResponse(body)) => {
                    return Err(backend_error(body))
                }
                BackendMessage::Standard(_) => {
                    return Err(Error::Connection(
                        "Expected CopyBothResponse to START_REPLICATION".to_string(),
                    ))
                }
            }
        }
    }

    /// Receives the next frame of the CopyBoth stream; `None` means the
    /// server ended it.
    pub async fn recv_frame(&mut self) -> Result<Option<ReplicationFrame>> {
        loop {
            match self.read_standard().await? {
                Message::CopyData(body) => {
                    return ReplicationFrame::parse(body.into_bytes()).map(Some)
                }
                Message::CopyDone
                | Message::CommandComplete(_)
                | Message::ReadyForQuery(_) => return Ok(None),
                Message::NoticeResponse(_) | Message::ParameterStatus(_) => {}
                Message::ErrorResponse(body) => return Err(backend_error(body)),
                _ => {
                    return Err(Error::Connection(
                        "Unexpected message on replication stream".to_string(),
                    ))
                }
            }
        }
    }

    /// Sends a Standby Status Update confirming positions up to `lsn`.
    pub async fn standby_status_update(&mut self, lsn: u64, reply_requested: bool) -> Result<()> {
        debug!("Standby status update for LSN {}", format_lsn(lsn));

        let mut body = BytesMut::with_capacity(34);
        body.put_u8(b'r');
        body.put_u64(lsn); // written
        body.put_u64(lsn); // flushed
        body.put_u64(lsn); // applied
        body.put_i64(Utc::now().timestamp_micros() - UNIX_TO_PG_EPOCH_MICROS);
        body.put_u8(reply_requested as u8);

        let mut out = BytesMut::new();
        frontend::CopyData::new(&body[..])?.write(&mut out);
        self.send(out).await
    }

    pub async fn close(mut self) -> Result<()> {
        info!("Closing replication connection");
        let mut buf = BytesMut::new();
        frontend::terminate(&mut buf);
        self.send(buf).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Runs one walsender command over the simple-query protocol and
    /// collects its rows, positionally.
    async fn simple_command(&mut self, query: &str) -> Result<Vec<Vec<Option<String>>>> {
        let mut buf = BytesMut::new();
        frontend::query(query, &mut buf)?;
        self.send(buf).await?;

        let mut rows = Vec::new();
        let mut command_error = None;
        loop {
            match self.read_standard().await? {
                Message::DataRow(body) => rows.push(row_values(&body)?),
                Message::RowDescription(_)
                | Message::CommandComplete(_)
                | Message::EmptyQueryResponse
                | Message::ParameterStatus(_)
                | Message::NoticeResponse(_) => {}
                // The server still finishes with ReadyForQuery after an
                // error; drain to it before surfacing.
                Message::ErrorResponse(body) => command_error = Some(backend_error(body)),
                Message::ReadyForQuery(_) => break,
                _ => {
                    return Err(Error::Connection(
                        "Unexpected message in command response".to_string(),
                    ))
                }
            }
        }
        match command_error {
            Some(e) => Err(e),
            None => Ok(rows),
        }
    }

    async fn read_message(&mut self) -> Result<BackendMessage> {
        loop {
            if let Some(message) = parse_backend_message(&mut self.read_buf)? {
                return Ok(message);
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(Error::Connection(
                    "Server closed the connection".to_string(),
                ));
            }
        }
    }

    /// Reads the next message, rejecting a CopyBothResponse; valid outside
    /// [`start_replication`](Self::start_replication).
    async fn read_standard(&mut self) -> Result<Message> {
        match self.read_message().await? {
            BackendMessage::Standard(message) => Ok(message),
            BackendMessage::CopyBothResponse => Err(Error::Connection(
                "Unexpected CopyBothResponse".to_string(),
            )),
        }
    }

    async fn send(&mut self, buf: BytesMut) -> Result<()> {
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// The slot options requested when opening the stream. They fix the wire
/// shape the decoder assumes: pretty-printed output, chunked delivery,
/// transaction id and timestamp in every header, and not-null flags only
/// in metadata mode.
pub fn stream_options(include_metadata: bool, tables: &[String]) -> Vec<(&'static str, String)> {
    let mut options = vec![
        ("pretty-print", "1".to_string()),
        ("write-in-chunks", "1".to_string()),
        ("include-xids", "1".to_string()),
        ("include-timestamp", "1".to_string()),
    ];
    if include_metadata {
        options.push(("include-not-null", "true".to_string()));
    }
    if !tables.is_empty() {
        options.push(("add-tables", tables.join(",")));
    }
    options
}

fn parse_backend_message(buf: &mut BytesMut) -> Result<Option<BackendMessage>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    if buf[0] == COPY_BOTH_RESPONSE_TAG {
        let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
        if len < 4 {
            return Err(Error::Connection(
                "Invalid CopyBothResponse length".to_string(),
            ));
        }
        if buf.len() < len + 1 {
            return Ok(None);
        }
        buf.advance(len + 1);
        return Ok(Some(BackendMessage::CopyBothResponse));
    }
    Ok(Message::parse(buf)?.map(BackendMessage::Standard))
}

fn row_values(body: &backend::DataRowBody) -> Result<Vec<Option<String>>> {
    let buffer = body.buffer();
    let mut values = Vec::new();
    let mut ranges = body.ranges();
    while let Some(range) = ranges.next()? {
        values.push(range.map(|r| String::from_utf8_lossy(&buffer[r]).into_owned()));
    }
    Ok(values)
}

fn value_at(row: &[Option<String>], index: usize) -> Option<&str> {
    row.get(index).and_then(|value| value.as_deref())
}

/// Folds an ErrorResponse into an error carrying the SQLSTATE code, which
/// the slot commands match on.
fn backend_error(body: backend::ErrorResponseBody) -> Error {
    let mut code = String::new();
    let mut message = String::new();
    let mut fields = body.fields();
    while let Ok(Some(field)) = fields.next() {
        match field.type_() {
            b'C' => code = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            b'M' => message = String::from_utf8_lossy(field.value_bytes()).into_owned(),
            _ => {}
        }
    }
    Error::Replication {
        message: format!("{}: {}", code, message),
    }
}

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub system_id: String,
    pub timeline: i32,
    pub xlogpos: String,
    pub dbname: Option<String>,
}

/// One message received over the CopyBoth stream.
#[derive(Debug)]
pub enum ReplicationFrame {
    /// An XLogData frame; `payload` is one raw wal2json chunk.
    XLogData { wal_end: u64, payload: Bytes },
    /// Primary keepalive; reply promptly when `reply_requested` is set.
    Keepalive { wal_end: u64, reply_requested: bool },
}

impl ReplicationFrame {
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.is_empty() {
            return Err(Error::Replication {
                message: "Empty replication frame".to_string(),
            });
        }

        let tag = data[0];
        let mut cursor = &data[1..];

        match tag {
            b'w' => {
                if cursor.remaining() < 24 {
                    return Err(Error::Replication {
                        message: "Invalid XLogData header size".to_string(),
                    });
                }
                let _wal_start = cursor.get_u64();
                let wal_end = cursor.get_u64();
                let _send_time = cursor.get_i64();

                Ok(ReplicationFrame::XLogData {
                    wal_end,
                    payload: data.slice(25..),
                })
            }
            b'k' => {
                if cursor.remaining() < 17 {
                    return Err(Error::Replication {
                        message: "Invalid keepalive frame size".to_string(),
                    });
                }
                let wal_end = cursor.get_u64();
                let _send_time = cursor.get_i64();
                let reply_requested = cursor.get_u8() != 0;

                Ok(ReplicationFrame::Keepalive {
                    wal_end,
                    reply_requested,
                })
            }
            _ => Err(Error::Replication {
                message: format!("Unknown replication frame tag: {}", tag as char),
            }),
        }
    }
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

pub fn parse_lsn(lsn: &str) -> Result<u64> {
    let (hi, lo) = lsn.split_once('/').ok_or_else(|| Error::Replication {
        message: format!("Invalid LSN: {}", lsn),
    })?;
    let hi = u64::from_str_radix(hi, 16).map_err(|_| Error::Replication {
        message: format!("Invalid LSN: {}", lsn),
    })?;
    let lo = u64::from_str_radix(lo, 16).map_err(|_| Error::Replication {
        message: format!("Invalid LSN: {}", lsn),
    })?;
    Ok((hi << 32) | lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_round_trip() {
        let lsn = parse_lsn("16/B374D848").unwrap();
        assert_eq!(lsn, 0x16_B374_D848);
        assert_eq!(format_lsn(lsn), "16/B374D848");
        assert_eq!(format_lsn(0), "0/0");
    }

    #[test]
    fn rejects_malformed_lsn() {
        assert!(parse_lsn("deadbeef").is_err());
        assert!(parse_lsn("x/y").is_err());
    }

    #[test]
    fn parses_xlogdata_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'w');
        buf.put_u64(100);
        buf.put_u64(200);
        buf.put_i64(0);
        buf.put(&b"{\"xid\": 1"[..]);

        match ReplicationFrame::parse(buf.freeze()).unwrap() {
            ReplicationFrame::XLogData { wal_end, payload } => {
                assert_eq!(wal_end, 200);
                assert_eq!(&payload[..], b"{\"xid\": 1");
            }
            other => panic!("expected XLogData, got {:?}", other),
        }
    }

    #[test]
    fn parses_keepalive_frame() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'k');
        buf.put_u64(300);
        buf.put_i64(0);
        buf.put_u8(1);

        match ReplicationFrame::parse(buf.freeze()).unwrap() {
            ReplicationFrame::Keepalive {
                wal_end,
                reply_requested,
            } => {
                assert_eq!(wal_end, 300);
                assert!(reply_requested);
            }
            other => panic!("expected Keepalive, got {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_frame_tag() {
        let data = Bytes::from_static(b"x123");
        assert!(ReplicationFrame::parse(data).is_err());
    }

    #[test]
    fn frames_copy_both_response() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'W');
        buf.put_i32(9); // length, including itself
        buf.put_u8(0); // overall format
        buf.put_u16(1); // column count
        buf.put_u16(0); // per-column format
        // A trailing byte of the next message must be left in place.
        buf.put_u8(b'd');

        match parse_backend_message(&mut buf).unwrap() {
            Some(BackendMessage::CopyBothResponse) => {}
            _ => panic!("expected CopyBothResponse"),
        }
        assert_eq!(&buf[..], b"d");
    }

    #[test]
    fn incomplete_message_waits_for_more_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'W');
        buf.put_i32(9);
        // Body not yet arrived.
        assert!(matches!(parse_backend_message(&mut buf), Ok(None)));
        assert_eq!(buf.len(), 5);
    }

    #[test]
    fn reads_data_row_values_positionally() {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_i32(25); // length, including itself
        buf.put_u16(2); // column count
        buf.put_i32(11);
        buf.put_slice(b"16/B374D848");
        buf.put_i32(-1); // NULL

        match Message::parse(&mut buf).unwrap().unwrap() {
            Message::DataRow(body) => {
                let values = row_values(&body).unwrap();
                assert_eq!(values, vec![Some("16/B374D848".to_string()), None]);
            }
            _ => panic!("expected DataRow"),
        }
    }

    #[test]
    fn backend_error_carries_sqlstate() {
        let fields = b"C42710\0Mreplication slot \"capture\" already exists\0\0";
        let mut buf = BytesMut::new();
        buf.put_u8(b'E');
        buf.put_i32(4 + fields.len() as i32);
        buf.put_slice(fields);

        match Message::parse(&mut buf).unwrap().unwrap() {
            Message::ErrorResponse(body) => {
                let text = backend_error(body).to_string();
                assert!(text.contains("42710"));
                assert!(text.contains("already exists"));
            }
            _ => panic!("expected ErrorResponse"),
        }
    }

    #[test]
    fn negotiates_metadata_flags_only_when_enabled() {
        let base = stream_options(false, &[]);
        assert_eq!(
            base.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            vec![
                "pretty-print",
                "write-in-chunks",
                "include-xids",
                "include-timestamp"
            ]
        );

        let with_metadata = stream_options(true, &[]);
        assert!(with_metadata
            .iter()
            .any(|(name, value)| *name == "include-not-null" && value == "true"));

        let filtered = stream_options(false, &["public.users".to_string()]);
        assert!(filtered
            .iter()
            .any(|(name, value)| *name == "add-tables" && value == "public.users"));
    }
}
