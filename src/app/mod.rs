//! 进程级装配：加载状态、构造各组件、启动持久化任务

pub mod facade;
pub mod persist;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::AdapterSet;
use crate::common::Result;
use crate::compiler::GraphCompiler;
use crate::config::{Paths, SupervisorOptions};
use crate::helper::default_helper;
use crate::repository::{EventBus, MemoryStore};
use crate::resources::{Downloader, GithubReleaseInstaller, HttpDownloader};
use crate::supervisor::{Supervisor, SupervisorDeps};
use crate::sysproxy::OsProxyDriver;
use crate::tun::TunManager;

pub use facade::{Facade, FacadeDeps};
pub use persist::Persistor;

pub struct App {
    pub paths: Paths,
    pub facade: Arc<Facade>,
    cancel: CancellationToken,
    persist_task: JoinHandle<()>,
}

impl App {
    /// 状态文件损坏时返回错误，调用方应中止启动
    pub async fn bootstrap(paths: Paths, options: SupervisorOptions) -> Result<Self> {
        let events = EventBus::default();
        let store = Arc::new(match persist::load_state(&paths.state_file)? {
            Some(state) => {
                info!(path = %paths.state_file.display(), nodes = state.nodes.len(), frouters = state.frouters.len(), "state loaded");
                MemoryStore::from_state(state, events.clone())
            }
            None => {
                info!(path = %paths.state_file.display(), "no saved state, starting fresh");
                MemoryStore::new(events.clone())
            }
        });

        let downloader: Arc<dyn Downloader> = Arc::new(HttpDownloader::new()?);
        let adapters = AdapterSet::defaults();
        let tun = Arc::new(TunManager::system(default_helper(paths.helper_socket())?));

        let supervisor = Arc::new(Supervisor::new(SupervisorDeps {
            paths: paths.clone(),
            options,
            adapters: adapters.clone(),
            compiler: Arc::new(GraphCompiler),
            nodes: store.clone(),
            frouters: store.clone(),
            components: store.clone(),
            settings: store.clone(),
            downloader: downloader.clone(),
            tun,
        }));
        let installer = Arc::new(GithubReleaseInstaller::new(
            downloader,
            store.clone(),
            adapters.clone(),
            paths.clone(),
        ));
        let facade = Arc::new(Facade::new(FacadeDeps {
            store: store.clone(),
            supervisor,
            installer,
            sysproxy: Arc::new(OsProxyDriver),
            adapters,
        }));

        let persistor = Arc::new(Persistor::new(paths.state_file.clone(), store));
        let cancel = CancellationToken::new();
        let persist_task = persistor.spawn(&events, cancel.clone());

        facade.ensure_default_components().await?;
        facade.ensure_default_frouter().await?;

        Ok(Self {
            paths,
            facade,
            cancel,
            persist_task,
        })
    }

    /// 停内核并落盘最后一次快照
    pub async fn shutdown(self) {
        if let Err(e) = self.facade.supervisor().stop().await {
            warn!(error = %e, "stop kernel on shutdown failed");
        }
        self.cancel.cancel();
        if let Err(e) = self.persist_task.await {
            warn!(error = %e, "persist task join failed");
        }
        info!("vea stopped");
    }
}
