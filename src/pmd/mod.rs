//! PMD (physical memory disk): 把一段固定的物理内存窗口暴露为一个块设备.
//!
//! 上层 (host 块 I/O 子系统) 以扇区为单位发起读写请求,
//! 本模块把扇区地址换算成字节偏移, 做越界检查, 然后直接在映射出来的内存上拷贝数据.
//!
//! 各层从下到上:
//! - `BackingStore`: 映射后的物理内存区域, 只暴露带边界检查的 read_at/write_at
//! - [`Device`]: 设备生命周期 (注册 -> 映射 -> 请求队列 -> 发布磁盘), 以及逆序拆除
//! - 请求分发循环: [`Device::run_queue`], 从 host 队列里逐个拉取 segment 并完成它
//! - `OpenGate`: open/release 的簿记, 与分发路径互不相交

mod backing;
mod config;
mod dispatch;
mod error;
mod gate;
mod host;
mod lifecycle;

#[cfg(test)]
mod proptests;

/// Use a sector size of 512 bytes
pub const SECTOR_SIZE: usize = 512;
/// 物理内存窗口的默认起始地址
pub const PMD_BASE: u64 = 0x8400_0000;
/// 主地址映射失败时, 在 PMD_BASE 基础上偏移这么多再试一次
pub const PMD_FALLBACK_OFFSET: u64 = 0x1000_0000;
/// 默认容量: 0x10000 个扇区 = 32 MiB
pub const PMD_SECTORS: u64 = 0x10000;
/// Major number, taken from the range reserved for local/experimental use.
pub const PMD_MAJOR: u32 = 240;
/// 注册到 host 的设备名
pub const DEVICE_NAME: &str = "PMD";
/// 发布出去的磁盘名
pub const DISK_NAME: &str = "pmd";
/// 只有一个物理磁盘, 不支持分区
pub const PMD_MINORS: u32 = 1;

/// 扇区号 -> 字节偏移, 溢出时返回 None
pub fn sector_offset(sector: u64) -> Option<u64> {
    sector.checked_mul(SECTOR_SIZE as u64)
}

pub use config::PmdConfig;
pub use error::HostError;
pub use host::{
    BlockHost, Direction, Gendisk, MappedRegion, RequestQueue, RequestTag, Segment, SegmentData,
    Status,
};
pub use lifecycle::Device;

// 只有测试直接用到的类型
#[allow(unused)]
pub use dispatch::DispatchStats;
#[allow(unused)]
pub use error::{InitError, InitStage};
#[allow(unused)]
pub use gate::GateStatus;
#[allow(unused)]
pub use lifecycle::RegistrationState;
