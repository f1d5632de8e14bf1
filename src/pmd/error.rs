use std::fmt;

use thiserror::Error;

/// 初始化过程中哪一步的资源获取失败了
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    Map,
    Queue,
    Disk,
}

impl fmt::Display for InitStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InitStage::Map => "mapping the backing region",
            InitStage::Queue => "initializing the request queue",
            InitStage::Disk => "publishing the disk",
        })
    }
}

/// Errors returned by [`Device::init`](super::Device::init).
///
/// 返回任何一个错误时, 之前获得的资源都已经被逆序释放了.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InitError {
    #[error("major {major} is already registered")]
    Busy { major: u32 },

    #[error("out of resources while {0}")]
    OutOfResources(InitStage),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// 单个请求 segment 的失败, 只影响这一个 segment
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("bad access: offset={offset} len={len} capacity={capacity}")]
    OutOfRange { offset: u64, len: usize, capacity: u64 },
}

/// Failures reported by the host block-I/O subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("major {major} is already taken by {owner}")]
    IdentityTaken { major: u32, owner: &'static str },

    #[error("major {0} is not registered")]
    NotRegistered(u32),

    #[error("cannot map {len:#x} bytes at {phys:#x}")]
    MapFailed { phys: u64, len: usize },

    #[error("nothing is mapped at {0:#x}")]
    NotMapped(u64),

    #[error("request queue allocation failed")]
    QueueUnavailable,

    #[error("disk allocation failed")]
    DiskUnavailable,

    #[error("disk {0} is not published")]
    NotPublished(&'static str),
}
