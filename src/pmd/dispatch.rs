//! 请求分发循环.
//!
//! host 有请求待处理时调用 [`Device::run_queue`](super::Device::run_queue),
//! 循环一直运行到 host 队列报告为空:
//! 1. 起始偏移 = start_sector * 512
//! 2. 越界: 这个 segment 以 IoError 完成, 不碰存储, 继续处理下一个
//! 3. 否则直接在存储和调用者缓冲区之间拷贝
//! 4. 向 host 报告这个 segment 的完成状态
//!
//! 不做调度也不做重排, 严格按 host 投递的顺序处理, 同一时刻只处理一个 segment.
//! 整个循环运行在分发锁 (自旋锁) 里, 因此这里不能有任何会阻塞的操作.

use log::{error, trace};

use super::{
    backing::BackingStore,
    error::IoError,
    host::{RequestQueue, Segment, SegmentData, Status},
    sector_offset, SECTOR_SIZE,
};

/// 一次分发循环的统计
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// 成功完成的 segment 数
    pub completed: usize,
    /// 以 IoError 完成的 segment 数
    pub failed: usize,
}

impl DispatchStats {
    #[allow(unused)]
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// 把队列取空, 调用者需持有分发锁
pub(super) fn drain<Q: RequestQueue>(queue: &mut Q, store: &mut BackingStore) -> DispatchStats {
    let mut stats = DispatchStats::default();
    while let Some(segment) = queue.next_pending_segment() {
        let tag = segment.tag;
        let sector = segment.start_sector;
        let len = segment.byte_length();
        let status = match transfer(store, segment) {
            Ok(()) => {
                stats.completed += 1;
                Status::Ok
            }
            Err(err) => {
                error!(
                    "PMD: bad access: block={}, count={} ({})",
                    sector,
                    len.div_ceil(SECTOR_SIZE),
                    err
                );
                stats.failed += 1;
                Status::IoError
            }
        };
        queue.complete(tag, status);
    }
    stats
}

/// 一个 segment 的直接拷贝, 越界检查由 BackingStore 完成
fn transfer(store: &mut BackingStore, segment: Segment<'_>) -> Result<(), IoError> {
    let len = segment.byte_length();
    let offset = sector_offset(segment.start_sector).ok_or(IoError::OutOfRange {
        offset: u64::MAX,
        len,
        capacity: store.size_bytes() as u64,
    })?;
    trace!(
        "PMD: {:?} sector={} len={}",
        segment.direction(),
        segment.start_sector,
        len
    );
    match segment.data {
        SegmentData::Read(buf) => store.read_at(offset, buf),
        SegmentData::Write(buf) => store.write_at(offset, buf),
    }
}
