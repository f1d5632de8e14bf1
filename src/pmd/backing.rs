//! Backing Store: 映射后的物理内存区域.
//!
//! 所有访问都经过 [`BackingStore::read_at`] / [`BackingStore::write_at`],
//! 越界检查就在这一层完成, 上层无法构造出越界访问.
//! 存储本身不加锁, 调用者通过唯一的分发循环串行访问.

use super::{error::IoError, host::MappedRegion};

pub struct BackingStore {
    region: MappedRegion,
}

impl BackingStore {
    pub fn new(region: MappedRegion) -> Self {
        Self { region }
    }

    /// 容量, 单位为字节
    pub fn size_bytes(&self) -> usize {
        self.region.len()
    }

    /// 检查 [offset, offset + len) 是否整个落在区域内, 返回区域内的字节范围
    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>, IoError> {
        let out_of_range = || IoError::OutOfRange {
            offset,
            len,
            capacity: self.size_bytes() as u64,
        };
        let start = usize::try_from(offset).map_err(|_| out_of_range())?;
        let end = start.checked_add(len).ok_or_else(out_of_range)?;
        if end > self.size_bytes() {
            return Err(out_of_range());
        }
        Ok(start..end)
    }

    /// 从 offset 处读 buf.len() 个字节到 buf
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), IoError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.region.as_slice()[range]);
        Ok(())
    }

    /// 把 data 写到 offset 处
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), IoError> {
        let range = self.range(offset, data.len())?;
        self.region.as_mut_slice()[range].copy_from_slice(data);
        Ok(())
    }

    /// 交还映射, 用于 iounmap
    pub fn into_region(self) -> MappedRegion {
        self.region
    }
}
