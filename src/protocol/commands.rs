//! Command and device error codes.
//!
//! Commands are grouped by bus in blocks of 16: system `0x0_`, I2C `0x1_`,
//! SPI/QSPI `0x2_`, ISP `0x3_`, SWD `0x4_`, bootloader `0x50`.

// ============================================================================
// System
// ============================================================================

/// Liveness check; the device answers `CA FE`.
pub const SYS_PING: u8 = 0x01;
/// Capability document (JSON).
pub const SYS_GET_CAPS: u8 = 0x02;
/// Status byte, uptime and (optionally) free RAM.
pub const SYS_GET_STATUS: u8 = 0x03;
/// Reset the programmer.
pub const SYS_RESET: u8 = 0x04;
/// Debug: raw GPIO levels of the SPI pins.
pub const SYS_GPIO_TEST: u8 = 0x05;

// ============================================================================
// I2C
// ============================================================================

/// Scan the bus; answers `count, addr...`.
pub const I2C_SCAN: u8 = 0x10;
/// Read `len` bytes from a device.
pub const I2C_READ: u8 = 0x11;
/// Write bytes to a device.
pub const I2C_WRITE: u8 = 0x12;

// ============================================================================
// SPI / QSPI
// ============================================================================

/// Probe for a flash chip via JEDEC ID.
pub const SPI_SCAN: u8 = 0x20;
/// Set SPI mode and clock.
pub const SPI_CONFIG: u8 = 0x21;
/// Full-duplex transfer.
pub const SPI_XFER: u8 = 0x22;
/// Select the QSPI lane mode (0-5).
pub const QSPI_SET_MODE: u8 = 0x25;
/// Extended read: cmd, address, dummy cycles, length.
pub const QSPI_READ: u8 = 0x26;
/// Extended write: cmd, address, data.
pub const QSPI_WRITE: u8 = 0x27;
/// Page read using the current lane mode.
pub const QSPI_FAST_READ: u8 = 0x28;
/// Raw flash command with optional TX data.
pub const QSPI_CMD: u8 = 0x29;

// ============================================================================
// In-system programming (AVR)
// ============================================================================

/// Enter programming mode.
pub const ISP_ENTER: u8 = 0x30;
/// 4-byte ISP instruction transfer.
pub const ISP_XFER: u8 = 0x31;
/// Leave programming mode.
pub const ISP_EXIT: u8 = 0x32;

// ============================================================================
// Serial wire debug
// ============================================================================

/// Initialise the debug port.
pub const SWD_INIT: u8 = 0x40;
/// Read a debug-port register.
pub const SWD_READ: u8 = 0x41;
/// Write a debug-port register.
pub const SWD_WRITE: u8 = 0x42;

// ============================================================================
// Bootloader
// ============================================================================

/// Reboot into the firmware update bootloader.
pub const BOOTLOADER: u8 = 0x50;

// ============================================================================
// Device error codes (payload byte 0 of an error response)
// ============================================================================

/// No driver handles the command.
pub const ERR_UNKNOWN_CMD: u8 = 0x01;
/// The driver rejected the command, or the request failed its CRC check.
pub const ERR_CMD_FAILED: u8 = 0x02;
/// Request payload exceeded the device buffer.
pub const ERR_PAYLOAD_TOO_LARGE: u8 = 0x06;

/// Human-readable name of a command code.
pub fn command_name(cmd: u8) -> &'static str {
    match cmd {
        SYS_PING => "SYS_PING",
        SYS_GET_CAPS => "SYS_GET_CAPS",
        SYS_GET_STATUS => "SYS_GET_STATUS",
        SYS_RESET => "SYS_RESET",
        SYS_GPIO_TEST => "SYS_GPIO_TEST",
        I2C_SCAN => "I2C_SCAN",
        I2C_READ => "I2C_READ",
        I2C_WRITE => "I2C_WRITE",
        SPI_SCAN => "SPI_SCAN",
        SPI_CONFIG => "SPI_CONFIG",
        SPI_XFER => "SPI_XFER",
        QSPI_SET_MODE => "QSPI_SET_MODE",
        QSPI_READ => "QSPI_READ",
        QSPI_WRITE => "QSPI_WRITE",
        QSPI_FAST_READ => "QSPI_FAST_READ",
        QSPI_CMD => "QSPI_CMD",
        ISP_ENTER => "ISP_ENTER",
        ISP_XFER => "ISP_XFER",
        ISP_EXIT => "ISP_EXIT",
        SWD_INIT => "SWD_INIT",
        SWD_READ => "SWD_READ",
        SWD_WRITE => "SWD_WRITE",
        BOOTLOADER => "BOOTLOADER",
        _ => "UNKNOWN",
    }
}
