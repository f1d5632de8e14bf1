//! 设备生命周期: 初始化和拆除.
//!
//! 初始化按 注册标识 -> 映射存储 -> 构造请求队列 -> 发布磁盘 的顺序获取资源,
//! 每获取一个就记录在 [`Resources`] 里. 任何一步失败, Resources 被 drop,
//! 已经获取的资源按相反顺序释放; 拆除走的也是同一条释放路径.
//! 因此部分初始化的设备不会被重复释放, 也不会被重复注销.

use std::sync::Arc;

use log::{info, warn};
use spin::Mutex;

use super::{
    backing::BackingStore,
    config::PmdConfig,
    dispatch::{self, DispatchStats},
    error::{InitError, InitStage},
    gate::{GateStatus, OpenGate},
    host::{BlockHost, Gendisk, MappedRegion},
    DEVICE_NAME, DISK_NAME, PMD_MINORS,
};

/// 初始化时只会前进, 拆除时只会后退
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegistrationState {
    Unregistered,
    Registered,
    Mapped,
    QueueReady,
    DiskPublished,
}

/// 已经获取的资源, 按获取顺序排列
struct Resources<H: BlockHost> {
    host: Arc<H>,
    major: u32,
    registered: bool,
    store: Option<BackingStore>,
    queue: Option<H::Queue>,
    disk: Option<Gendisk>,
}

impl<H: BlockHost> Resources<H> {
    fn new(host: Arc<H>, major: u32) -> Self {
        Self {
            host,
            major,
            registered: false,
            store: None,
            queue: None,
            disk: None,
        }
    }

    #[allow(unused)]
    fn state(&self) -> RegistrationState {
        if self.disk.is_some() {
            RegistrationState::DiskPublished
        } else if self.queue.is_some() {
            RegistrationState::QueueReady
        } else if self.store.is_some() {
            RegistrationState::Mapped
        } else if self.registered {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }

    /// 逆序释放实际获取过的资源; 每一步都是尽力而为, 失败只记日志
    fn release(&mut self) {
        if let Some(disk) = self.disk.take() {
            if let Err(err) = self.host.del_disk(&disk) {
                warn!("PMD: del_disk failed: {}", err);
            }
        }
        if let Some(queue) = self.queue.take() {
            if let Err(err) = self.host.cleanup_queue(queue) {
                warn!("PMD: blk_cleanup_queue failed: {}", err);
            }
        }
        if let Some(store) = self.store.take() {
            if let Err(err) = self.host.iounmap(store.into_region()) {
                warn!("PMD: iounmap failed: {}", err);
            }
        }
        if self.registered {
            self.registered = false;
            if let Err(err) = self.host.unregister_blkdev(self.major, DEVICE_NAME) {
                warn!("PMD: unregister_blkdev failed: {}", err);
            }
        }
    }
}

impl<H: BlockHost> Drop for Resources<H> {
    fn drop(&mut self) {
        self.release();
    }
}

/// 先映射主地址, 失败再映射 fallback 地址
fn map_backing<H: BlockHost>(
    host: &H,
    config: &PmdConfig,
    size: usize,
) -> Result<MappedRegion, InitError> {
    match host.ioremap(config.base_address, size) {
        Ok(region) => Ok(region),
        Err(err) => {
            warn!("PMD: Cannot map PMD memory ({})", err);
            let fallback = config.fallback_address()?;
            host.ioremap(fallback, size).map_err(|err| {
                warn!("PMD: Cannot map PMD memory at fallback ({})", err);
                InitError::OutOfResources(InitStage::Map)
            })
        }
    }
}

/// A physical memory disk brought up on a host block subsystem.
///
/// 由调用 [`Device::init`] 的一方持有, 显式地传给分发循环和 open/release.
pub struct Device<H: BlockHost> {
    config: PmdConfig,
    size_bytes: usize,
    mapped_at: u64,
    /// 分发锁: 保护请求队列和存储, 持锁期间只做内存拷贝和完成通知
    dispatch: Mutex<Resources<H>>,
    gate: OpenGate,
}

impl<H: BlockHost> Device<H> {
    pub fn init(host: Arc<H>, config: PmdConfig) -> Result<Self, InitError> {
        let size_bytes = config.validate()?;

        if let Err(err) = host.register_blkdev(config.major, DEVICE_NAME) {
            warn!("PMD: Cannot assign major:{} ({})", config.major, err);
            return Err(InitError::Busy {
                major: config.major,
            });
        }
        info!("PMD: block driver registered");
        let mut resources = Resources::new(Arc::clone(&host), config.major);
        resources.registered = true;

        // 从这里开始任何 `?` 返回都会 drop resources, 释放已获取的资源
        let region = map_backing(&*host, &config, size_bytes)?;
        let mapped_at = region.phys();
        info!("PMD: Mapped PMD at {:#x} size:{}", mapped_at, size_bytes);
        resources.store = Some(BackingStore::new(region));

        let queue = host.init_queue().map_err(|err| {
            warn!("PMD: blk_init_queue failed ({})", err);
            InitError::OutOfResources(InitStage::Queue)
        })?;
        resources.queue = Some(queue);
        info!("PMD: block queue initialized");

        let disk = Gendisk {
            name: DISK_NAME,
            major: config.major,
            first_minor: 0,
            minors: PMD_MINORS,
            capacity: config.sector_count,
        };
        host.add_disk(&disk).map_err(|err| {
            warn!("PMD: alloc_disk failed ({})", err);
            InitError::OutOfResources(InitStage::Disk)
        })?;
        resources.disk = Some(disk);
        info!(
            "PMD: disk {} published, {} sectors",
            DISK_NAME, config.sector_count
        );

        Ok(Self {
            config,
            size_bytes,
            mapped_at,
            dispatch: Mutex::new(resources),
            gate: OpenGate::new(),
        })
    }

    /// 撤下磁盘, 销毁队列, 解除映射, 注销标识, 严格按这个顺序. 从不失败.
    pub fn teardown(self) {
        let mut resources = self.dispatch.into_inner();
        resources.release();
        info!("PMD: torn down");
    }

    /// 请求分发循环: 拉取并处理 segment 直到 host 队列为空
    pub fn run_queue(&self) -> DispatchStats {
        let mut resources = self.dispatch.lock();
        let Resources {
            store: Some(store),
            queue: Some(queue),
            ..
        } = &mut *resources
        else {
            return DispatchStats::default();
        };
        dispatch::drain(queue, store)
    }

    /// 在分发锁内访问 host 队列, host 投递请求时使用
    pub fn with_queue<R>(&self, f: impl FnOnce(&mut H::Queue) -> R) -> Option<R> {
        self.dispatch.lock().queue.as_mut().map(f)
    }

    pub fn open(&self) {
        self.gate.open(0);
    }

    pub fn release(&self) {
        self.gate.release();
    }

    #[allow(unused)]
    pub fn gate_status(&self) -> GateStatus {
        self.gate.status()
    }

    /// 容量, 单位为扇区
    pub fn capacity(&self) -> u64 {
        self.config.sector_count
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// 实际映射的物理地址: 主地址或 fallback 地址
    pub fn mapped_at(&self) -> u64 {
        self.mapped_at
    }

    #[allow(unused)]
    pub fn state(&self) -> RegistrationState {
        self.dispatch.lock().state()
    }

    #[allow(unused)]
    pub fn gendisk(&self) -> Option<Gendisk> {
        self.dispatch.lock().disk.clone()
    }
}
