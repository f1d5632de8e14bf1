use super::{
    error::InitError, PMD_BASE, PMD_FALLBACK_OFFSET, PMD_MAJOR, PMD_SECTORS, SECTOR_SIZE,
};

/// 构建/初始化时确定的配置常量, 运行期间不可协商
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmdConfig {
    /// 物理内存窗口的起始地址
    pub base_address: u64,
    /// 主地址映射失败时使用 base_address + fallback_offset
    pub fallback_offset: u64,
    /// 容量 (扇区数)
    pub sector_count: u64,
    pub major: u32,
}

impl Default for PmdConfig {
    fn default() -> Self {
        Self {
            base_address: PMD_BASE,
            fallback_offset: PMD_FALLBACK_OFFSET,
            sector_count: PMD_SECTORS,
            major: PMD_MAJOR,
        }
    }
}

impl PmdConfig {
    #[allow(unused)]
    pub fn with_sectors(sector_count: u64) -> Self {
        Self {
            sector_count,
            ..Self::default()
        }
    }

    /// size_bytes = sector_count * 512
    pub fn size_bytes(&self) -> Result<usize, InitError> {
        if self.sector_count == 0 {
            return Err(InitError::InvalidConfig("sector count must be non-zero"));
        }
        self.sector_count
            .checked_mul(SECTOR_SIZE as u64)
            .and_then(|size| usize::try_from(size).ok())
            .ok_or(InitError::InvalidConfig("capacity does not fit the address space"))
    }

    pub fn fallback_address(&self) -> Result<u64, InitError> {
        self.base_address
            .checked_add(self.fallback_offset)
            .ok_or(InitError::InvalidConfig("fallback address overflows"))
    }

    /// 在获取任何资源之前检查配置
    pub fn validate(&self) -> Result<usize, InitError> {
        let size = self.size_bytes()?;
        for base in [self.base_address, self.fallback_address()?] {
            if base.checked_add(size as u64).is_none() {
                return Err(InitError::InvalidConfig("region end overflows"));
            }
        }
        Ok(size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_32_mib() {
        let config = PmdConfig::default();
        assert_eq!(config.validate(), Ok(32 * 1024 * 1024));
        assert_eq!(config.fallback_address(), Ok(0x9400_0000));
    }

    #[test]
    fn rejects_degenerate_configs() {
        assert!(matches!(
            PmdConfig::with_sectors(0).validate(),
            Err(InitError::InvalidConfig(_))
        ));
        assert!(matches!(
            PmdConfig::with_sectors(u64::MAX).validate(),
            Err(InitError::InvalidConfig(_))
        ));
        let config = PmdConfig {
            base_address: u64::MAX - 0x100,
            ..PmdConfig::with_sectors(16)
        };
        assert!(matches!(
            config.validate(),
            Err(InitError::InvalidConfig(_))
        ));
    }
}
