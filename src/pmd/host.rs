//! host 块 I/O 子系统的接口层.
//!
//! 驱动本身不负责枚举设备, 投递请求, 或者把完成信号转交给发起者,
//! 这些都是 host 的工作. 这里定义驱动需要 host 提供的接口:
//! - [`BlockHost`]: 注册/注销设备标识, 映射/解除映射物理内存, 构造/销毁请求队列, 发布/撤下磁盘
//! - [`RequestQueue`]: 拉取式的请求队列, 驱动反复调用 next_pending_segment 直到返回 None

use std::ptr::NonNull;

use super::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// host 为每个请求分配的标识, 完成信号按它回报
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTag(pub u64);

/// 请求调用者的缓冲区, 只在一次传输期间借给驱动
#[derive(Debug)]
pub enum SegmentData<'a> {
    /// 从设备读到这里
    Read(&'a mut [u8]),
    /// 把这里的数据写到设备
    Write(&'a [u8]),
}

/// 一个请求的一段; 一个逻辑请求可能被 host 拆成多个 segment 依次投递
#[derive(Debug)]
pub struct Segment<'a> {
    pub tag: RequestTag,
    pub start_sector: u64,
    pub data: SegmentData<'a>,
}

impl Segment<'_> {
    pub fn direction(&self) -> Direction {
        match self.data {
            SegmentData::Read(_) => Direction::Read,
            SegmentData::Write(_) => Direction::Write,
        }
    }

    pub fn byte_length(&self) -> usize {
        match &self.data {
            SegmentData::Read(buf) => buf.len(),
            SegmentData::Write(buf) => buf.len(),
        }
    }
}

/// 每个 segment 的完成状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    IoError,
}

/// 发布给 host 的磁盘描述
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gendisk {
    pub name: &'static str,
    pub major: u32,
    pub first_minor: u32,
    pub minors: u32,
    /// 容量, 单位为扇区
    pub capacity: u64,
}

/// A CPU-addressable view of a physical memory window.
///
/// 这是整个驱动里唯一持有裸指针的地方. 指针只在映射时 (from_raw_parts) 产生,
/// 之后只能通过长度固定的切片访问.
#[derive(Debug)]
pub struct MappedRegion {
    phys: u64,
    ptr: NonNull<u8>,
    len: usize,
}

// MappedRegion 独占它指向的内存, 可以随所有者在线程之间移动
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes until the
    /// region is handed back through [`BlockHost::iounmap`], and nothing else
    /// may access that memory while the region is alive.
    pub unsafe fn from_raw_parts(phys: u64, ptr: NonNull<u8>, len: usize) -> Self {
        Self { phys, ptr, len }
    }

    /// 映射的物理起始地址
    pub fn phys(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub(super) fn as_slice(&self) -> &[u8] {
        // from_raw_parts 的调用者保证了 [ptr, ptr + len) 在 region 存活期间有效且独占
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub(super) fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

/// 拉取式请求队列.
///
/// 驱动在分发锁内循环调用 next_pending_segment, 每处理完一个 segment 调用一次 complete.
/// complete 之后再次拉取得到的可能是同一请求的下一段, 也可能是另一个请求.
pub trait RequestQueue: Send {
    fn next_pending_segment(&mut self) -> Option<Segment<'_>>;

    fn complete(&mut self, tag: RequestTag, status: Status);
}

/// The host block-I/O subsystem, as seen by the driver.
pub trait BlockHost: Send + Sync {
    type Queue: RequestQueue;

    fn register_blkdev(&self, major: u32, name: &'static str) -> Result<(), HostError>;

    fn unregister_blkdev(&self, major: u32, name: &'static str) -> Result<(), HostError>;

    fn ioremap(&self, phys: u64, len: usize) -> Result<MappedRegion, HostError>;

    fn iounmap(&self, region: MappedRegion) -> Result<(), HostError>;

    fn init_queue(&self) -> Result<Self::Queue, HostError>;

    fn cleanup_queue(&self, queue: Self::Queue) -> Result<(), HostError>;

    /// 分配并发布磁盘, 成功后设备对外可见
    fn add_disk(&self, disk: &Gendisk) -> Result<(), HostError>;

    fn del_disk(&self, disk: &Gendisk) -> Result<(), HostError>;
}
