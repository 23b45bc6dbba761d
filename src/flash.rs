//! SPI NOR flash and AVR workflows built from the raw bus operations.
//!
//! Flash access uses standard 1-1-1 mode and 24-bit addresses:
//! - status registers are read with raw `QSPI_CMD` opcodes `0x05`/`0x35`
//! - every program or erase is preceded by write-enable and a WEL check,
//!   and followed by polling BUSY until a deadline
//! - page program goes through `QSPI_WRITE`, never crossing a 256-byte page

use std::time::Duration;

use tokio::time::Instant;

use crate::client::ProtocolClient;
use crate::device::QspiMode;
use crate::error::{OpupError, Result};
use crate::protocol::MAX_PAYLOAD_SIZE;
use crate::transport::Transport;

/// Flash opcodes.
pub mod opcodes {
    pub const WRITE_STATUS_1: u8 = 0x01;
    pub const PAGE_PROGRAM: u8 = 0x02;
    pub const READ: u8 = 0x03;
    pub const READ_STATUS_1: u8 = 0x05;
    pub const WRITE_ENABLE: u8 = 0x06;
    pub const SECTOR_ERASE: u8 = 0x20;
    pub const WRITE_STATUS_2: u8 = 0x31;
    pub const READ_STATUS_2: u8 = 0x35;
    pub const BLOCK_ERASE_32K: u8 = 0x52;
    pub const READ_JEDEC_ID: u8 = 0x9F;
    pub const CHIP_ERASE: u8 = 0xC7;
    pub const BLOCK_ERASE_64K: u8 = 0xD8;
}

/// Program granularity.
pub const PAGE_SIZE: u32 = 256;

/// Smallest erasable unit.
pub const SECTOR_SIZE: u32 = 4096;

/// One past the highest 24-bit address.
pub const ADDRESS_SPACE: u32 = 1 << 24;

pub const PAGE_PROGRAM_TIMEOUT: Duration = Duration::from_secs(5);
pub const SECTOR_ERASE_TIMEOUT: Duration = Duration::from_secs(10);
pub const BLOCK_ERASE_TIMEOUT: Duration = Duration::from_secs(30);
pub const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(300);

/// Delay between BUSY polls.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

const SR1_BUSY: u8 = 0x01;
const SR1_WEL: u8 = 0x02;
const SR2_QE: u8 = 0x02;
/// Macronix keeps QE in status register 1.
const SR1_QE_MACRONIX: u8 = 0x40;

const MFG_MACRONIX: u8 = 0xC2;

/// Erase block granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    Kb32,
    Kb64,
}

impl BlockSize {
    fn opcode(self) -> u8 {
        match self {
            BlockSize::Kb32 => opcodes::BLOCK_ERASE_32K,
            BlockSize::Kb64 => opcodes::BLOCK_ERASE_64K,
        }
    }

    /// Block size in bytes.
    pub fn bytes(self) -> u32 {
        match self {
            BlockSize::Kb32 => 32 * 1024,
            BlockSize::Kb64 => 64 * 1024,
        }
    }

    /// Start of the block containing `addr`.
    pub fn align(self, addr: u32) -> u32 {
        addr & !(self.bytes() - 1)
    }
}

/// Status registers 1 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRegisters {
    pub sr1: u8,
    pub sr2: u8,
}

impl StatusRegisters {
    /// Program or erase in progress.
    pub fn is_busy(&self) -> bool {
        self.sr1 & SR1_BUSY != 0
    }

    /// Write enable latch set.
    pub fn write_enabled(&self) -> bool {
        self.sr1 & SR1_WEL != 0
    }

    /// Block protect bits BP0-BP2.
    pub fn block_protect(&self) -> u8 {
        (self.sr1 >> 2) & 0x07
    }

    /// Quad enable, where most vendors keep it (SR2 bit 1).
    pub fn quad_enabled(&self) -> bool {
        self.sr2 & SR2_QE != 0
    }
}

/// Split a write of `len` bytes at `addr` into `(addr, offset, len)` pieces
/// that each stay within one page.
pub fn page_chunks(addr: u32, len: usize) -> Vec<(u32, usize, usize)> {
    let mut chunks = Vec::new();
    let mut offset = 0;
    while offset < len {
        let current = addr + offset as u32;
        let room = (PAGE_SIZE - current % PAGE_SIZE) as usize;
        let size = room.min(len - offset);
        chunks.push((current, offset, size));
        offset += size;
    }
    chunks
}

fn check_range(addr: u32, len: usize) -> Result<()> {
    if u64::from(addr) + len as u64 > u64::from(ADDRESS_SPACE) {
        return Err(OpupError::InvalidArgument(format!(
            "range 0x{:06X}+{} exceeds 24-bit address space",
            addr, len
        )));
    }
    Ok(())
}

/// 24-bit address, most significant byte first, as raw commands expect it.
fn address_bytes(addr: u32) -> [u8; 3] {
    let [_, hi, mid, lo] = addr.to_be_bytes();
    [hi, mid, lo]
}

impl<T: Transport> ProtocolClient<T> {
    async fn read_register(&self, opcode: u8) -> Result<u8> {
        let reply = self.qspi_cmd(opcode, &[0]).await?;
        reply.first().copied().ok_or_else(|| {
            OpupError::Protocol(format!("empty reply to status read 0x{:02X}", opcode))
        })
    }

    /// Read both status registers.
    pub async fn flash_status(&self) -> Result<StatusRegisters> {
        self.qspi_set_mode(QspiMode::Standard).await?;
        Ok(StatusRegisters {
            sr1: self.read_register(opcodes::READ_STATUS_1).await?,
            sr2: self.read_register(opcodes::READ_STATUS_2).await?,
        })
    }

    /// Set the write enable latch and confirm it took.
    pub async fn flash_write_enable(&self) -> Result<()> {
        self.qspi_cmd(opcodes::WRITE_ENABLE, &[]).await?;
        let sr1 = self.read_register(opcodes::READ_STATUS_1).await?;
        if sr1 & SR1_WEL == 0 {
            return Err(OpupError::Flash(format!(
                "write enable did not latch (SR1=0x{:02X})",
                sr1
            )));
        }
        Ok(())
    }

    /// Poll BUSY until it clears or `timeout` passes.
    pub async fn flash_wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let sr1 = self.read_register(opcodes::READ_STATUS_1).await?;
            if sr1 & SR1_BUSY == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                tracing::warn!("Flash busy for longer than {:?}", timeout);
                return Err(OpupError::FlashBusy { timeout });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn erase(&self, opcode: u8, addr: Option<u32>, timeout: Duration) -> Result<()> {
        self.qspi_set_mode(QspiMode::Standard).await?;
        self.flash_write_enable().await?;
        match addr {
            Some(addr) => self.qspi_cmd(opcode, &address_bytes(addr)).await?,
            None => self.qspi_cmd(opcode, &[]).await?,
        };
        self.flash_wait_ready(timeout).await
    }

    /// Erase the 4 KiB sector containing `addr`.
    pub async fn flash_erase_sector(&self, addr: u32) -> Result<()> {
        check_range(addr, 0)?;
        let sector = addr & !(SECTOR_SIZE - 1);
        tracing::info!("Erasing sector at 0x{:06X}", sector);
        self.erase(opcodes::SECTOR_ERASE, Some(sector), SECTOR_ERASE_TIMEOUT)
            .await
    }

    /// Erase the 32 or 64 KiB block containing `addr`.
    pub async fn flash_erase_block(&self, addr: u32, size: BlockSize) -> Result<()> {
        check_range(addr, 0)?;
        let block = size.align(addr);
        tracing::info!("Erasing {:?} block at 0x{:06X}", size, block);
        self.erase(size.opcode(), Some(block), BLOCK_ERASE_TIMEOUT)
            .await
    }

    /// Erase the whole chip. Takes up to several minutes.
    pub async fn flash_chip_erase(&self) -> Result<()> {
        tracing::warn!("Erasing entire flash chip");
        self.erase(opcodes::CHIP_ERASE, None, CHIP_ERASE_TIMEOUT)
            .await
    }

    /// Program `data` at `addr` within a single page.
    ///
    /// Partial pages are fine; data running past the page end is rejected
    /// since the chip would wrap it to the page start.
    pub async fn flash_write_page(&self, addr: u32, data: &[u8]) -> Result<()> {
        check_range(addr, data.len())?;
        if (addr % PAGE_SIZE) as usize + data.len() > PAGE_SIZE as usize {
            return Err(OpupError::InvalidArgument(format!(
                "{} bytes at 0x{:06X} cross a page boundary",
                data.len(),
                addr
            )));
        }
        self.qspi_set_mode(QspiMode::Standard).await?;
        self.flash_write_enable().await?;
        self.qspi_write(opcodes::PAGE_PROGRAM, addr, 3, data).await?;
        self.flash_wait_ready(PAGE_PROGRAM_TIMEOUT).await
    }

    /// Program `data` at `addr`, one page at a time. The range must be erased.
    pub async fn flash_write(&self, addr: u32, data: &[u8]) -> Result<()> {
        check_range(addr, data.len())?;
        for (page_addr, offset, len) in page_chunks(addr, data.len()) {
            self.flash_write_page(page_addr, &data[offset..offset + len])
                .await?;
            tracing::debug!("Programmed {} bytes at 0x{:06X}", len, page_addr);
        }
        tracing::info!("Wrote {} bytes at 0x{:06X}", data.len(), addr);
        Ok(())
    }

    /// Read `len` bytes starting at `addr`.
    pub async fn flash_read(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        check_range(addr, len)?;
        self.qspi_set_mode(QspiMode::Standard).await?;

        let mut data = Vec::with_capacity(len);
        while data.len() < len {
            let chunk = (len - data.len()).min(MAX_PAYLOAD_SIZE);
            let chunk_addr = addr + data.len() as u32;
            let reply = self
                .qspi_read(opcodes::READ, chunk_addr, 3, 0, chunk as u16)
                .await?;
            if reply.len() < chunk {
                return Err(OpupError::Protocol(format!(
                    "flash read at 0x{:06X} returned {} of {} bytes",
                    chunk_addr,
                    reply.len(),
                    chunk
                )));
            }
            data.extend_from_slice(&reply[..chunk]);
        }
        Ok(data)
    }

    /// Set the quad enable bit the way the chip's vendor expects.
    pub async fn flash_quad_enable(&self) -> Result<()> {
        self.qspi_set_mode(QspiMode::Standard).await?;
        let jedec = self.qspi_cmd(opcodes::READ_JEDEC_ID, &[0; 3]).await?;
        let Some(&manufacturer) = jedec.first() else {
            return Err(OpupError::Protocol("empty JEDEC ID reply".to_string()));
        };
        let macronix = manufacturer == MFG_MACRONIX;

        let status = self.flash_status().await?;
        let enabled = |s: StatusRegisters| {
            if macronix {
                s.sr1 & SR1_QE_MACRONIX != 0
            } else {
                s.quad_enabled()
            }
        };
        if enabled(status) {
            return Ok(());
        }

        self.flash_write_enable().await?;
        if macronix {
            self.qspi_cmd(opcodes::WRITE_STATUS_1, &[status.sr1 | SR1_QE_MACRONIX])
                .await?;
        } else {
            self.qspi_cmd(opcodes::WRITE_STATUS_2, &[SR2_QE]).await?;
        }
        self.flash_wait_ready(PAGE_PROGRAM_TIMEOUT).await?;

        let status = self.flash_status().await?;
        if !enabled(status) {
            return Err(OpupError::Flash(format!(
                "quad enable bit did not set (SR1=0x{:02X} SR2=0x{:02X})",
                status.sr1, status.sr2
            )));
        }
        tracing::info!("Quad mode enabled on manufacturer 0x{:02X}", manufacturer);
        Ok(())
    }

    /// Read the three AVR signature bytes over ISP.
    ///
    /// Programming mode is left again even if a read fails.
    pub async fn avr_read_signature(&self) -> Result<[u8; 3]> {
        self.isp_enter().await?;

        let mut signature = [0u8; 3];
        let mut result = Ok(());
        for (index, byte) in (0u8..).zip(signature.iter_mut()) {
            match self.isp_transfer([0x30, 0x00, index, 0x00]).await {
                Ok(reply) => *byte = reply[3],
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        let exit = self.isp_exit().await;
        result?;
        exit?;
        Ok(signature)
    }
}
