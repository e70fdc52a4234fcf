use crate::stats::EnvironmentStats;
use beanscan_core::{CompilerFrontend, LookupEnvironment, Project, Result, ScanError};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OnceCell, OwnedRwLockReadGuard, RwLock};
use tracing::{debug, info, warn};

struct EnvironmentSlot {
    cell: OnceCell<Arc<dyn LookupEnvironment>>,
}

/// Read access to a project's environment. While any lease is alive the environment
/// cannot be invalidated; clones share the same read lock.
#[derive(Clone)]
pub struct EnvironmentLease {
    environment: Arc<dyn LookupEnvironment>,
    _guard: Arc<OwnedRwLockReadGuard<()>>,
}

impl EnvironmentLease {
    pub fn environment(&self) -> &dyn LookupEnvironment {
        self.environment.as_ref()
    }
}

/// Per-project cache of frontend lookup environments.
///
/// Builds are single-flight and run on a detached task, so a caller going away does
/// not abort a build other callers wait for. Invalidation takes the project write
/// lock, which waits for every outstanding [`EnvironmentLease`], and releases the
/// environment explicitly.
pub struct ProjectEnvironmentCache {
    frontend: Arc<dyn CompilerFrontend>,
    slots: Arc<DashMap<String, Arc<EnvironmentSlot>>>,
    locks: DashMap<String, Arc<RwLock<()>>>,
    stats: Arc<Mutex<EnvironmentStats>>,
}

impl ProjectEnvironmentCache {
    pub fn new(frontend: Arc<dyn CompilerFrontend>) -> Self {
        Self {
            frontend,
            slots: Arc::new(DashMap::new()),
            locks: DashMap::new(),
            stats: Arc::new(Mutex::new(EnvironmentStats::default())),
        }
    }

    fn lock_for(&self, project: &str) -> Arc<RwLock<()>> {
        self.locks
            .entry(project.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Acquires the project read lock, then the environment.
    pub async fn lease(&self, project: &Project) -> Result<EnvironmentLease> {
        let guard = self.lock_for(&project.name).read_owned().await;
        let environment = self.get(project).await?;
        Ok(EnvironmentLease {
            environment,
            _guard: Arc::new(guard),
        })
    }

    /// Memoized environment of `project`. Concurrent callers share one build.
    pub async fn get(&self, project: &Project) -> Result<Arc<dyn LookupEnvironment>> {
        let slot = self
            .slots
            .entry(project.name.clone())
            .or_insert_with(|| {
                Arc::new(EnvironmentSlot {
                    cell: OnceCell::new(),
                })
            })
            .clone();

        if let Some(environment) = slot.cell.get() {
            self.stats.lock().reuses += 1;
            return Ok(Arc::clone(environment));
        }

        let build = tokio::spawn(Self::build(
            Arc::clone(&self.frontend),
            Arc::clone(&self.slots),
            Arc::clone(&self.stats),
            slot,
            project.clone(),
        ));
        build
            .await
            .map_err(|e| ScanError::Frontend(format!("Environment build task failed: {}", e)))?
    }

    async fn build(
        frontend: Arc<dyn CompilerFrontend>,
        slots: Arc<DashMap<String, Arc<EnvironmentSlot>>>,
        stats: Arc<Mutex<EnvironmentStats>>,
        slot: Arc<EnvironmentSlot>,
        project: Project,
    ) -> Result<Arc<dyn LookupEnvironment>> {
        let mut built_here = false;
        let environment = slot
            .cell
            .get_or_try_init(|| async {
                built_here = true;
                let started = Instant::now();
                let name = project.name.clone();
                let environment = tokio::task::spawn_blocking({
                    let frontend = Arc::clone(&frontend);
                    let project = project.clone();
                    move || frontend.create_environment(&project)
                })
                .await
                .map_err(|e| ScanError::Frontend(format!("Environment build panicked: {}", e)))??;
                stats.lock().builds += 1;
                info!(
                    project = %name,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Built lookup environment"
                );
                Ok::<_, ScanError>(environment)
            })
            .await?
            .clone();

        if !built_here {
            stats.lock().reuses += 1;
        }

        let current = slots
            .get(&project.name)
            .map(|s| Arc::ptr_eq(&s, &slot))
            .unwrap_or(false);
        if !current {
            if built_here {
                release_environment(&stats, &project.name, environment.as_ref());
            }
            return Err(ScanError::Cancelled(format!(
                "environment of {} invalidated during build",
                project.name
            )));
        }
        Ok(environment)
    }

    /// Drops and releases the environment of `project` once in-flight parses finish.
    pub async fn invalidate(&self, project: &str) -> bool {
        let lock = self.lock_for(project);
        let _write = lock.write().await;
        match self.slots.remove(project) {
            Some((_, slot)) => {
                if let Some(environment) = slot.cell.get() {
                    release_environment(&self.stats, project, environment.as_ref());
                }
                debug!(project, "Invalidated lookup environment");
                true
            }
            None => false,
        }
    }

    /// Invalidates and forgets the project lock as well.
    pub async fn remove_project(&self, project: &str) {
        self.invalidate(project).await;
        self.locks.remove(project);
    }

    pub async fn invalidate_all(&self) {
        let projects: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for project in projects {
            self.invalidate(&project).await;
        }
    }

    pub fn contains(&self, project: &str) -> bool {
        self.slots
            .get(project)
            .map(|slot| slot.cell.initialized())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> EnvironmentStats {
        let mut stats = self.stats.lock().clone();
        stats.live = self
            .slots
            .iter()
            .filter(|slot| slot.cell.initialized())
            .count();
        stats
    }
}

fn release_environment(
    stats: &Mutex<EnvironmentStats>,
    project: &str,
    environment: &dyn LookupEnvironment,
) {
    match environment.release() {
        Ok(()) => stats.lock().releases += 1,
        Err(e) => {
            stats.lock().release_failures += 1;
            warn!(project, error = %e, leak = true, "Failed to release lookup environment");
        }
    }
}
