//! Typed device operations.
//!
//! Each operation is a thin layer over [`ProtocolClient::send_command`]: a
//! payload builder and a response parser, both plain functions so they can
//! be checked without a device.
//!
//! Multi-byte integers are little-endian on the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::ProtocolClient;
use crate::error::{OpupError, Result};
use crate::protocol::{commands, MAX_PAYLOAD_SIZE};
use crate::transport::Transport;

/// Bytes the device answers a ping with.
pub const PING_REPLY: [u8; 2] = [0xCA, 0xFE];

/// Largest TX/RX length of a raw QSPI command.
pub const QSPI_CMD_MAX_LEN: usize = 64;

/// Largest page count of a QSPI fast read (256 bytes each).
pub const QSPI_FAST_READ_MAX_PAGES: u8 = 16;

/// Capability document returned by `SYS_GET_CAPS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Protocol name, `"opup"`.
    pub proto: String,
    /// Protocol version.
    pub ver: String,
    /// Supported buses, e.g. `["i2c", "spi", "isp", "swd"]`.
    #[serde(default)]
    pub caps: Vec<String>,
}

impl Capabilities {
    /// Check if the device advertises `capability`.
    pub fn supports(&self, capability: &str) -> bool {
        self.caps.iter().any(|c| c.eq_ignore_ascii_case(capability))
    }
}

/// Answer to `SYS_GET_STATUS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// Device state; 0 means idle.
    pub state: u8,
    /// Milliseconds since the device booted.
    pub uptime_ms: u32,
    /// Free RAM in bytes, if the firmware reports it.
    pub free_ram: Option<u32>,
}

impl DeviceStatus {
    /// Check if the device reports no operation in progress.
    pub fn is_idle(&self) -> bool {
        self.state == 0
    }

    /// Time since the device booted.
    pub fn uptime(&self) -> Duration {
        Duration::from_millis(u64::from(self.uptime_ms))
    }
}

/// JEDEC identification of a SPI flash chip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JedecId {
    /// Manufacturer ID (e.g. `0xEF` for Winbond).
    pub manufacturer: u8,
    /// Memory type (high byte) and capacity (low byte).
    pub device: u16,
}

/// QSPI lane configuration, as `command-address-data` line counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum QspiMode {
    /// 1-1-1
    Standard = 0,
    /// 1-1-2
    DualOutput = 1,
    /// 1-2-2
    DualIo = 2,
    /// 1-1-4
    QuadOutput = 3,
    /// 1-4-4
    QuadIo = 4,
    /// 4-4-4
    Qpi = 5,
}

impl TryFrom<u8> for QspiMode {
    type Error = OpupError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => QspiMode::Standard,
            1 => QspiMode::DualOutput,
            2 => QspiMode::DualIo,
            3 => QspiMode::QuadOutput,
            4 => QspiMode::QuadIo,
            5 => QspiMode::Qpi,
            other => {
                return Err(OpupError::Protocol(format!("unknown QSPI mode {}", other)));
            }
        })
    }
}

// ============================================================================
// Payload builders
// ============================================================================

/// `[addr][len LE16]`
pub fn i2c_read_payload(addr: u8, len: u16) -> Result<[u8; 3]> {
    if usize::from(len) > MAX_PAYLOAD_SIZE {
        return Err(OpupError::InvalidArgument(format!(
            "I2C read of {} bytes exceeds {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }
    let [lo, hi] = len.to_le_bytes();
    Ok([addr, lo, hi])
}

/// `[addr][data...]`
pub fn i2c_write_payload(addr: u8, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(1 + data.len());
    payload.push(addr);
    payload.extend_from_slice(data);
    payload
}

/// `[mode][freq LE32]`
pub fn spi_config_payload(mode: u8, frequency_hz: u32) -> Result<[u8; 5]> {
    if mode > 3 {
        return Err(OpupError::InvalidArgument(format!("SPI mode {} (expected 0-3)", mode)));
    }
    let [f0, f1, f2, f3] = frequency_hz.to_le_bytes();
    Ok([mode, f0, f1, f2, f3])
}

fn check_address(addr: u32, addr_len: u8) -> Result<()> {
    if !(1..=4).contains(&addr_len) {
        return Err(OpupError::InvalidArgument(format!(
            "address length {} (expected 1-4)",
            addr_len
        )));
    }
    if addr_len < 4 && addr >> (u32::from(addr_len) * 8) != 0 {
        return Err(OpupError::InvalidArgument(format!(
            "address 0x{:X} does not fit in {} bytes",
            addr, addr_len
        )));
    }
    Ok(())
}

/// `[cmd][addr_len][addr LE, addr_len bytes][dummy][len LE16]`
pub fn qspi_read_payload(cmd: u8, addr: u32, addr_len: u8, dummy_cycles: u8, len: u16) -> Result<Vec<u8>> {
    check_address(addr, addr_len)?;
    if usize::from(len) > MAX_PAYLOAD_SIZE {
        return Err(OpupError::InvalidArgument(format!(
            "QSPI read of {} bytes exceeds {}",
            len, MAX_PAYLOAD_SIZE
        )));
    }

    let mut payload = Vec::with_capacity(5 + usize::from(addr_len));
    payload.push(cmd);
    payload.push(addr_len);
    payload.extend_from_slice(&addr.to_le_bytes()[..usize::from(addr_len)]);
    payload.push(dummy_cycles);
    payload.extend_from_slice(&len.to_le_bytes());
    Ok(payload)
}

/// `[cmd][addr_len][addr LE, addr_len bytes][data...]`
pub fn qspi_write_payload(cmd: u8, addr: u32, addr_len: u8, data: &[u8]) -> Result<Vec<u8>> {
    check_address(addr, addr_len)?;

    let mut payload = Vec::with_capacity(2 + usize::from(addr_len) + data.len());
    payload.push(cmd);
    payload.push(addr_len);
    payload.extend_from_slice(&addr.to_le_bytes()[..usize::from(addr_len)]);
    payload.extend_from_slice(data);
    Ok(payload)
}

/// `[addr LE24][pages]`
pub fn qspi_fast_read_payload(addr: u32, pages: u8) -> Result<[u8; 4]> {
    check_address(addr, 3)?;
    if pages == 0 || pages > QSPI_FAST_READ_MAX_PAGES {
        return Err(OpupError::InvalidArgument(format!(
            "{} pages (expected 1-{})",
            pages, QSPI_FAST_READ_MAX_PAGES
        )));
    }
    let [a0, a1, a2, _] = addr.to_le_bytes();
    Ok([a0, a1, a2, pages])
}

/// `[cmd][len][tx...]`. With empty `tx` the device clocks in `len` bytes.
pub fn qspi_cmd_payload(cmd: u8, len: usize, tx: &[u8]) -> Result<Vec<u8>> {
    if len > QSPI_CMD_MAX_LEN {
        return Err(OpupError::InvalidArgument(format!(
            "QSPI command length {} exceeds {}",
            len, QSPI_CMD_MAX_LEN
        )));
    }
    if !tx.is_empty() && tx.len() != len {
        return Err(OpupError::InvalidArgument(format!(
            "QSPI TX of {} bytes for length {}",
            tx.len(),
            len
        )));
    }

    let mut payload = Vec::with_capacity(2 + tx.len());
    payload.push(cmd);
    payload.push(len as u8);
    payload.extend_from_slice(tx);
    Ok(payload)
}

// ============================================================================
// Response parsers
// ============================================================================

fn truncated(what: &str, expected: usize, got: usize) -> OpupError {
    OpupError::Protocol(format!(
        "{} response too short: expected {} bytes, got {}",
        what, expected, got
    ))
}

/// Accepts only the `CA FE` liveness reply.
pub fn parse_ping(payload: &[u8]) -> Result<()> {
    if payload == PING_REPLY {
        Ok(())
    } else {
        Err(OpupError::Protocol(format!(
            "unexpected ping reply {:02X?}",
            payload
        )))
    }
}

/// The firmware may append a C string terminator; it is ignored.
pub fn parse_caps(payload: &[u8]) -> Result<Capabilities> {
    let end = payload
        .iter()
        .rposition(|&b| b != 0)
        .map_or(0, |last| last + 1);
    Ok(serde_json::from_slice(&payload[..end])?)
}

/// `[state][uptime LE32]` optionally followed by `[free_ram LE32]`.
pub fn parse_status(payload: &[u8]) -> Result<DeviceStatus> {
    if payload.len() < 5 {
        return Err(truncated("status", 5, payload.len()));
    }
    let uptime_ms = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    let free_ram = payload
        .get(5..9)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]));

    Ok(DeviceStatus {
        state: payload[0],
        uptime_ms,
        free_ram,
    })
}

/// `[count][addr...]`
pub fn parse_i2c_scan(payload: &[u8]) -> Result<Vec<u8>> {
    let Some((&count, addrs)) = payload.split_first() else {
        return Err(truncated("I2C scan", 1, 0));
    };
    let count = usize::from(count);
    if addrs.len() < count {
        return Err(truncated("I2C scan", 1 + count, payload.len()));
    }
    Ok(addrs[..count].to_vec())
}

/// `[1][mfg][type][capacity]` when a chip answered, `[0][raw...]` otherwise.
pub fn parse_spi_scan(payload: &[u8]) -> Result<Option<JedecId>> {
    match payload {
        [0, ..] => Ok(None),
        [_, manufacturer, hi, lo, ..] => Ok(Some(JedecId {
            manufacturer: *manufacturer,
            device: u16::from_be_bytes([*hi, *lo]),
        })),
        _ => Err(truncated("SPI scan", 4, payload.len())),
    }
}

/// `[1]` if the device applied the configuration, anything else is a refusal.
pub fn parse_spi_config(payload: &[u8]) -> Result<()> {
    match payload.first() {
        Some(1) => Ok(()),
        Some(_) => Err(OpupError::Protocol(
            "device rejected the SPI configuration".to_string(),
        )),
        None => Err(truncated("SPI config", 1, 0)),
    }
}

/// The four bytes clocked back during an ISP instruction. Extra bytes are ignored.
pub fn parse_isp_transfer(payload: &[u8]) -> Result<[u8; 4]> {
    payload
        .get(..4)
        .and_then(|b| <[u8; 4]>::try_from(b).ok())
        .ok_or_else(|| truncated("ISP transfer", 4, payload.len()))
}

// ============================================================================
// Client operations
// ============================================================================

impl<T: Transport> ProtocolClient<T> {
    /// Send a command and hand back the response payload.
    async fn call(&self, cmd: u8, payload: &[u8]) -> Result<Vec<u8>> {
        Ok(self.send_command(cmd, payload).await?.payload().to_vec())
    }

    /// Check that the device is alive.
    pub async fn ping(&self) -> Result<()> {
        parse_ping(&self.call(commands::SYS_PING, &[]).await?)
    }

    /// Read the capability document.
    pub async fn get_caps(&self) -> Result<Capabilities> {
        parse_caps(&self.call(commands::SYS_GET_CAPS, &[]).await?)
    }

    /// Read state, uptime and free RAM.
    pub async fn get_status(&self) -> Result<DeviceStatus> {
        parse_status(&self.call(commands::SYS_GET_STATUS, &[]).await?)
    }

    /// Reset the device. It acknowledges before restarting.
    pub async fn reset(&self) -> Result<()> {
        self.call(commands::SYS_RESET, &[]).await.map(drop)
    }

    /// Raw levels of the SPI pins, for wiring checks.
    pub async fn gpio_test(&self) -> Result<Vec<u8>> {
        self.call(commands::SYS_GPIO_TEST, &[]).await
    }

    /// Reboot into the firmware update bootloader.
    ///
    /// The device acknowledges before rebooting; the link drops afterwards.
    pub async fn enter_bootloader(&self) -> Result<()> {
        self.call(commands::BOOTLOADER, &[]).await.map(drop)
    }

    /// Addresses of the devices that acknowledged on the I2C bus.
    pub async fn i2c_scan(&self) -> Result<Vec<u8>> {
        parse_i2c_scan(&self.call(commands::I2C_SCAN, &[]).await?)
    }

    /// Read `len` bytes from the I2C device at 7-bit `addr`.
    ///
    /// A reply shorter than `len` is a protocol error.
    pub async fn i2c_read(&self, addr: u8, len: u16) -> Result<Vec<u8>> {
        let data = self
            .call(commands::I2C_READ, &i2c_read_payload(addr, len)?)
            .await?;
        if data.len() < usize::from(len) {
            return Err(truncated("I2C read", usize::from(len), data.len()));
        }
        Ok(data)
    }

    /// Write `data` to the I2C device at 7-bit `addr`.
    pub async fn i2c_write(&self, addr: u8, data: &[u8]) -> Result<()> {
        self.call(commands::I2C_WRITE, &i2c_write_payload(addr, data))
            .await
            .map(drop)
    }

    /// Read the JEDEC ID of the attached flash, `None` if nothing answered.
    pub async fn spi_scan(&self) -> Result<Option<JedecId>> {
        parse_spi_scan(&self.call(commands::SPI_SCAN, &[]).await?)
    }

    /// Set the SPI mode (0-3) and clock frequency.
    pub async fn spi_config(&self, mode: u8, frequency_hz: u32) -> Result<()> {
        let payload = spi_config_payload(mode, frequency_hz)?;
        parse_spi_config(&self.call(commands::SPI_CONFIG, &payload).await?)
    }

    /// Full-duplex transfer; returns the bytes clocked in.
    pub async fn spi_transfer(&self, tx: &[u8]) -> Result<Vec<u8>> {
        self.call(commands::SPI_XFER, tx).await
    }

    /// Select the lane mode. Returns the mode the device reports afterwards.
    pub async fn qspi_set_mode(&self, mode: QspiMode) -> Result<QspiMode> {
        let reply = self.call(commands::QSPI_SET_MODE, &[mode as u8]).await?;
        let current = reply
            .first()
            .copied()
            .ok_or_else(|| truncated("QSPI set mode", 1, 0))?;
        QspiMode::try_from(current)
    }

    /// Flash read with an explicit opcode, address width and dummy cycles.
    pub async fn qspi_read(
        &self,
        cmd: u8,
        addr: u32,
        addr_len: u8,
        dummy_cycles: u8,
        len: u16,
    ) -> Result<Vec<u8>> {
        let payload = qspi_read_payload(cmd, addr, addr_len, dummy_cycles, len)?;
        self.call(commands::QSPI_READ, &payload).await
    }

    /// Flash write with an explicit opcode and address width, e.g. page program.
    pub async fn qspi_write(&self, cmd: u8, addr: u32, addr_len: u8, data: &[u8]) -> Result<()> {
        let payload = qspi_write_payload(cmd, addr, addr_len, data)?;
        self.call(commands::QSPI_WRITE, &payload).await.map(drop)
    }

    /// Read `pages` 256-byte pages with the fast-read command of the current mode.
    pub async fn qspi_fast_read(&self, addr: u32, pages: u8) -> Result<Vec<u8>> {
        let payload = qspi_fast_read_payload(addr, pages)?;
        self.call(commands::QSPI_FAST_READ, &payload).await
    }

    /// Raw flash command, sending `tx` and returning what was clocked in meanwhile.
    pub async fn qspi_cmd(&self, cmd: u8, tx: &[u8]) -> Result<Vec<u8>> {
        let payload = qspi_cmd_payload(cmd, tx.len(), tx)?;
        self.call(commands::QSPI_CMD, &payload).await
    }

    /// Raw flash command followed by reading `len` bytes.
    pub async fn qspi_cmd_read(&self, cmd: u8, len: usize) -> Result<Vec<u8>> {
        let payload = qspi_cmd_payload(cmd, len, &[])?;
        self.call(commands::QSPI_CMD, &payload).await
    }

    /// Hold the AVR target in reset and enable serial programming.
    pub async fn isp_enter(&self) -> Result<()> {
        self.call(commands::ISP_ENTER, &[]).await.map(drop)
    }

    /// One 4-byte AVR programming instruction.
    pub async fn isp_transfer(&self, instruction: [u8; 4]) -> Result<[u8; 4]> {
        parse_isp_transfer(&self.call(commands::ISP_XFER, &instruction).await?)
    }

    /// Release the AVR target from programming mode.
    pub async fn isp_exit(&self) -> Result<()> {
        self.call(commands::ISP_EXIT, &[]).await.map(drop)
    }

    /// Initialize the SWD debug port.
    pub async fn swd_init(&self) -> Result<()> {
        self.call(commands::SWD_INIT, &[]).await.map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ping() {
        assert!(parse_ping(&[0xCA, 0xFE]).is_ok());
        assert!(matches!(parse_ping(&[0xCA]), Err(OpupError::Protocol(_))));
    }

    #[test]
    fn test_parse_caps() {
        let json = br#"{"proto":"opup","ver":"2.0","caps":["i2c","spi","isp","swd"]}"#;
        let caps = parse_caps(json).unwrap();
        assert_eq!(caps.proto, "opup");
        assert_eq!(caps.ver, "2.0");
        assert!(caps.supports("SPI"));
        assert!(!caps.supports("jtag"));

        let mut terminated = json.to_vec();
        terminated.push(0);
        assert_eq!(parse_caps(&terminated).unwrap(), caps);

        assert!(matches!(parse_caps(b"not json"), Err(OpupError::Json(_))));
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status(&[0, 0x10, 0x27, 0, 0]).unwrap();
        assert!(status.is_idle());
        assert_eq!(status.uptime_ms, 10_000);
        assert_eq!(status.uptime(), Duration::from_secs(10));
        assert_eq!(status.free_ram, None);

        let status = parse_status(&[2, 1, 0, 0, 0, 0x00, 0x10, 0, 0]).unwrap();
        assert_eq!(status.state, 2);
        assert_eq!(status.free_ram, Some(4096));

        assert!(parse_status(&[0, 1, 2]).is_err());
    }

    #[test]
    fn test_parse_i2c_scan() {
        assert_eq!(parse_i2c_scan(&[2, 0x3C, 0x50]).unwrap(), vec![0x3C, 0x50]);
        assert_eq!(parse_i2c_scan(&[0]).unwrap(), Vec::<u8>::new());
        assert!(parse_i2c_scan(&[3, 0x3C]).is_err());
        assert!(parse_i2c_scan(&[]).is_err());
    }

    #[test]
    fn test_parse_spi_scan() {
        let id = parse_spi_scan(&[1, 0xEF, 0x40, 0x18]).unwrap().unwrap();
        assert_eq!(id.manufacturer, 0xEF);
        assert_eq!(id.device, 0x4018);

        // No chip: raw debug bytes follow.
        assert_eq!(parse_spi_scan(&[0, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap(), None);
        assert!(parse_spi_scan(&[1, 0xEF]).is_err());
    }

    #[test]
    fn test_spi_config() {
        assert_eq!(
            spi_config_payload(0, 1_000_000).unwrap(),
            [0, 0x40, 0x42, 0x0F, 0x00]
        );
        assert!(spi_config_payload(4, 1_000_000).is_err());
        assert!(parse_spi_config(&[1]).is_ok());
        assert!(parse_spi_config(&[0]).is_err());
    }

    #[test]
    fn test_i2c_payloads() {
        assert_eq!(i2c_read_payload(0x50, 0x0102).unwrap(), [0x50, 0x02, 0x01]);
        assert!(i2c_read_payload(0x50, 4097).is_err());
        assert_eq!(i2c_write_payload(0x3C, &[0xAE]), vec![0x3C, 0xAE]);
    }

    #[test]
    fn test_qspi_read_payload() {
        let payload = qspi_read_payload(0x0B, 0x123456, 3, 8, 256).unwrap();
        assert_eq!(payload, vec![0x0B, 3, 0x56, 0x34, 0x12, 8, 0x00, 0x01]);

        let payload = qspi_read_payload(0x0C, 0x01000000, 4, 8, 16).unwrap();
        assert_eq!(payload, vec![0x0C, 4, 0, 0, 0, 1, 8, 16, 0]);

        assert!(qspi_read_payload(0x0B, 0x1000000, 3, 8, 16).is_err());
        assert!(qspi_read_payload(0x0B, 0, 5, 8, 16).is_err());
    }

    #[test]
    fn test_qspi_write_and_fast_read_payloads() {
        assert_eq!(
            qspi_write_payload(0x02, 0x000100, 3, &[0xAA, 0xBB]).unwrap(),
            vec![0x02, 3, 0x00, 0x01, 0x00, 0xAA, 0xBB]
        );
        assert_eq!(
            qspi_fast_read_payload(0x010203, 4).unwrap(),
            [0x03, 0x02, 0x01, 4]
        );
        assert!(qspi_fast_read_payload(0, 0).is_err());
        assert!(qspi_fast_read_payload(0, 17).is_err());
    }

    #[test]
    fn test_qspi_cmd_payload() {
        assert_eq!(qspi_cmd_payload(0x06, 0, &[]).unwrap(), vec![0x06, 0]);
        assert_eq!(qspi_cmd_payload(0x9F, 3, &[]).unwrap(), vec![0x9F, 3]);
        assert_eq!(
            qspi_cmd_payload(0x01, 2, &[0x00, 0x02]).unwrap(),
            vec![0x01, 2, 0x00, 0x02]
        );
        assert!(qspi_cmd_payload(0x01, 65, &[]).is_err());
        assert!(qspi_cmd_payload(0x01, 3, &[1]).is_err());
    }

    #[test]
    fn test_qspi_mode_conversion() {
        assert_eq!(QspiMode::try_from(4).unwrap(), QspiMode::QuadIo);
        assert_eq!(QspiMode::Qpi as u8, 5);
        assert!(QspiMode::try_from(6).is_err());
    }

    #[test]
    fn test_parse_isp_transfer() {
        assert_eq!(
            parse_isp_transfer(&[0x00, 0x53, 0x00, 0x00]).unwrap(),
            [0x00, 0x53, 0x00, 0x00]
        );
        assert!(parse_isp_transfer(&[0x00]).is_err());
    }
}
