//! 在普通进程里模拟 host 块 I/O 子系统.
//!
//! 真实环境中这些由内核提供: 设备号注册表, ioremap, 请求队列, gendisk.
//! 这里用堆上分配的内存模拟物理内存窗口, 用 VecDeque 模拟请求队列,
//! 并支持故障注入, 方便测试初始化失败时的回退路径.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    ptr::NonNull,
    sync::{Mutex, MutexGuard},
};

use log::{debug, warn};

use crate::pmd::{
    BlockHost, Direction, Gendisk, HostError, MappedRegion, RequestQueue, RequestTag, Segment,
    SegmentData, Status, SECTOR_SIZE,
};

/// 默认 segment 大小, 一页
pub const DEFAULT_SEGMENT_SIZE: usize = 4096;

/// host 上发生过的事件, 按发生顺序记录
#[allow(unused)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Registered(u32),
    Unregistered(u32),
    Mapped(u64),
    Unmapped(u64),
    QueueCreated,
    QueueDestroyed,
    DiskAdded(&'static str),
    DiskRemoved(&'static str),
}

/// 一块模拟的物理内存, 解除映射后内容仍然保留
struct RamWindow {
    ptr: NonNull<u8>,
    len: usize,
    mapped: bool,
}

// RamWindow 只在 SimHost 的锁内被访问
unsafe impl Send for RamWindow {}

impl RamWindow {
    fn alloc(len: usize) -> Self {
        let raw = Box::into_raw(vec![0u8; len].into_boxed_slice());
        // Box::into_raw 不会返回空指针
        let ptr = NonNull::new(raw as *mut u8).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            mapped: false,
        }
    }
}

impl Drop for RamWindow {
    fn drop(&mut self) {
        let raw = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.len);
        drop(unsafe { Box::from_raw(raw) });
    }
}

#[derive(Default)]
struct SimState {
    majors: BTreeMap<u32, &'static str>,
    ram: BTreeMap<u64, RamWindow>,
    refused: BTreeSet<u64>,
    queues: usize,
    disks: Vec<Gendisk>,
    fail_next_queue: bool,
    fail_next_disk: bool,
    events: Vec<HostEvent>,
}

/// 模拟的 host 块 I/O 子系统
pub struct SimHost {
    state: Mutex<SimState>,
    segment_size: usize,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    pub fn new() -> Self {
        Self::with_segment_size(DEFAULT_SEGMENT_SIZE)
    }

    /// 新建的队列按 segment_size 拆分请求, segment_size 必须是扇区大小的整数倍
    pub fn with_segment_size(segment_size: usize) -> Self {
        assert!(
            segment_size > 0 && segment_size % SECTOR_SIZE == 0,
            "segment size must be a non-zero multiple of the sector size"
        );
        Self {
            state: Mutex::new(SimState::default()),
            segment_size,
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 之后所有对 phys 的映射都会失败
    pub fn refuse_mapping(&self, phys: u64) {
        self.lock().refused.insert(phys);
    }

    #[allow(unused)]
    pub fn allow_mapping(&self, phys: u64) {
        self.lock().refused.remove(&phys);
    }

    #[allow(unused)]
    pub fn fail_next_queue(&self) {
        self.lock().fail_next_queue = true;
    }

    #[allow(unused)]
    pub fn fail_next_disk(&self) {
        self.lock().fail_next_disk = true;
    }

    #[allow(unused)]
    pub fn is_registered(&self, major: u32) -> bool {
        self.lock().majors.contains_key(&major)
    }

    #[allow(unused)]
    pub fn is_mapped(&self, phys: u64) -> bool {
        self.lock().ram.get(&phys).map_or(false, |window| window.mapped)
    }

    #[allow(unused)]
    pub fn live_queues(&self) -> usize {
        self.lock().queues
    }

    #[allow(unused)]
    pub fn disks(&self) -> Vec<Gendisk> {
        self.lock().disks.clone()
    }

    #[allow(unused)]
    pub fn events(&self) -> Vec<HostEvent> {
        self.lock().events.clone()
    }

    #[allow(unused)]
    pub fn clear_events(&self) {
        self.lock().events.clear();
    }
}

impl BlockHost for SimHost {
    type Queue = SimQueue;

    fn register_blkdev(&self, major: u32, name: &'static str) -> Result<(), HostError> {
        let mut state = self.lock();
        if let Some(owner) = state.majors.get(&major) {
            return Err(HostError::IdentityTaken {
                major,
                owner: *owner,
            });
        }
        state.majors.insert(major, name);
        state.events.push(HostEvent::Registered(major));
        Ok(())
    }

    fn unregister_blkdev(&self, major: u32, _name: &'static str) -> Result<(), HostError> {
        let mut state = self.lock();
        state
            .majors
            .remove(&major)
            .ok_or(HostError::NotRegistered(major))?;
        state.events.push(HostEvent::Unregistered(major));
        Ok(())
    }

    fn ioremap(&self, phys: u64, len: usize) -> Result<MappedRegion, HostError> {
        let mut state = self.lock();
        if len == 0 || state.refused.contains(&phys) {
            return Err(HostError::MapFailed { phys, len });
        }
        let (mapped, reusable) = state
            .ram
            .get(&phys)
            .map_or((false, false), |window| (window.mapped, window.len == len));
        // 同一窗口不能同时被映射两次
        if mapped {
            return Err(HostError::MapFailed { phys, len });
        }
        if !reusable {
            state.ram.insert(phys, RamWindow::alloc(len));
        }
        let window = state
            .ram
            .get_mut(&phys)
            .ok_or(HostError::MapFailed { phys, len })?;
        window.mapped = true;
        // 窗口的内存一直存活到 SimHost 被 drop, 映射期间只有这一个 MappedRegion 访问它
        let region = unsafe { MappedRegion::from_raw_parts(phys, window.ptr, len) };
        state.events.push(HostEvent::Mapped(phys));
        debug!("sim: mapped {:#x} bytes at {:#x}", len, phys);
        Ok(region)
    }

    fn iounmap(&self, region: MappedRegion) -> Result<(), HostError> {
        let mut state = self.lock();
        let phys = region.phys();
        match state.ram.get_mut(&phys) {
            Some(window) if window.mapped && window.ptr.as_ptr() as *const u8 == region.as_ptr() => {
                window.mapped = false;
            }
            _ => return Err(HostError::NotMapped(phys)),
        }
        state.events.push(HostEvent::Unmapped(phys));
        Ok(())
    }

    fn init_queue(&self) -> Result<SimQueue, HostError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_queue) {
            return Err(HostError::QueueUnavailable);
        }
        state.queues += 1;
        state.events.push(HostEvent::QueueCreated);
        Ok(SimQueue::new(self.segment_size))
    }

    fn cleanup_queue(&self, queue: SimQueue) -> Result<(), HostError> {
        if !queue.pending.is_empty() {
            warn!("sim: queue destroyed with {} pending requests", queue.pending.len());
        }
        let mut state = self.lock();
        state.queues = state.queues.saturating_sub(1);
        state.events.push(HostEvent::QueueDestroyed);
        Ok(())
    }

    fn add_disk(&self, disk: &Gendisk) -> Result<(), HostError> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_disk) {
            return Err(HostError::DiskUnavailable);
        }
        debug!(
            "sim: disk {} ({}:{}, {} minors) capacity {} sectors",
            disk.name, disk.major, disk.first_minor, disk.minors, disk.capacity
        );
        state.disks.push(disk.clone());
        state.events.push(HostEvent::DiskAdded(disk.name));
        Ok(())
    }

    fn del_disk(&self, disk: &Gendisk) -> Result<(), HostError> {
        let mut state = self.lock();
        let idx = state
            .disks
            .iter()
            .position(|published| published == disk)
            .ok_or(HostError::NotPublished(disk.name))?;
        state.disks.remove(idx);
        state.events.push(HostEvent::DiskRemoved(disk.name));
        Ok(())
    }
}

/// 一个尚未完成的请求
struct SimRequest {
    tag: RequestTag,
    direction: Direction,
    start_sector: u64,
    buffer: Vec<u8>,
    /// 剩余 segment 的长度
    segments: VecDeque<usize>,
    /// 已经完成的字节数
    cursor: usize,
    status: Status,
}

/// 完成的请求; 任何一个 segment 失败, 整个请求的状态就是 IoError
#[allow(unused)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedRequest {
    pub tag: RequestTag,
    pub direction: Direction,
    pub start_sector: u64,
    pub buffer: Vec<u8>,
    pub status: Status,
}

/// 模拟的请求队列: 先进先出, 每个请求按 segment 依次交给驱动
pub struct SimQueue {
    pending: VecDeque<SimRequest>,
    finished: Vec<FinishedRequest>,
    signals: Vec<(RequestTag, Status)>,
    segment_size: usize,
    next_tag: u64,
}

impl SimQueue {
    pub fn new(segment_size: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            finished: Vec::new(),
            signals: Vec::new(),
            segment_size,
            next_tag: 0,
        }
    }

    fn split(&self, len: usize) -> Vec<usize> {
        let mut lens: Vec<usize> = (0..len / self.segment_size)
            .map(|_| self.segment_size)
            .collect();
        if len % self.segment_size != 0 || len == 0 {
            lens.push(len % self.segment_size);
        }
        lens
    }

    /// 按给定的 segment 长度投递请求.
    /// 除最后一段外每段都必须是扇区大小的整数倍, 总长度等于 buffer 长度.
    pub fn submit_segmented(
        &mut self,
        direction: Direction,
        start_sector: u64,
        buffer: Vec<u8>,
        segment_lens: &[usize],
    ) -> RequestTag {
        assert_eq!(segment_lens.iter().sum::<usize>(), buffer.len());
        if let Some((_, head)) = segment_lens.split_last() {
            assert!(head.iter().all(|len| len % SECTOR_SIZE == 0));
        }
        let tag = RequestTag(self.next_tag);
        self.next_tag += 1;
        self.pending.push_back(SimRequest {
            tag,
            direction,
            start_sector,
            buffer,
            segments: segment_lens.iter().copied().collect(),
            cursor: 0,
            status: Status::Ok,
        });
        tag
    }

    pub fn submit_write(&mut self, start_sector: u64, data: Vec<u8>) -> RequestTag {
        let lens = self.split(data.len());
        self.submit_segmented(Direction::Write, start_sector, data, &lens)
    }

    pub fn submit_read(&mut self, start_sector: u64, len: usize) -> RequestTag {
        let lens = self.split(len);
        self.submit_segmented(Direction::Read, start_sector, vec![0u8; len], &lens)
    }

    #[allow(unused)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// 所有 segment 级别的完成信号, 按发出的顺序
    #[allow(unused)]
    pub fn signals(&self) -> &[(RequestTag, Status)] {
        &self.signals
    }

    pub fn take_finished(&mut self) -> Vec<FinishedRequest> {
        std::mem::take(&mut self.finished)
    }
}

impl RequestQueue for SimQueue {
    fn next_pending_segment(&mut self) -> Option<Segment<'_>> {
        let request = self.pending.front_mut()?;
        let len = request.segments.front().copied().unwrap_or(0);
        let range = request.cursor..request.cursor + len;
        // 起始扇区靠近 u64::MAX 时饱和, 由驱动判为越界
        let start_sector = request
            .start_sector
            .saturating_add((request.cursor / SECTOR_SIZE) as u64);
        let data = match request.direction {
            Direction::Read => SegmentData::Read(&mut request.buffer[range]),
            Direction::Write => SegmentData::Write(&request.buffer[range]),
        };
        Some(Segment {
            tag: request.tag,
            start_sector,
            data,
        })
    }

    fn complete(&mut self, tag: RequestTag, status: Status) {
        self.signals.push((tag, status));
        let Some(request) = self.pending.front_mut() else {
            warn!("sim: completion for {:?} with an empty queue", tag);
            return;
        };
        if request.tag != tag {
            warn!("sim: completion for {:?} while {:?} is current", tag, request.tag);
            return;
        }
        request.cursor += request.segments.pop_front().unwrap_or(0);
        if status == Status::IoError {
            request.status = Status::IoError;
        }
        if request.segments.is_empty() {
            if let Some(request) = self.pending.pop_front() {
                self.finished.push(FinishedRequest {
                    tag: request.tag,
                    direction: request.direction,
                    start_sector: request.start_sector,
                    buffer: request.buffer,
                    status: request.status,
                });
            }
        }
    }
}
