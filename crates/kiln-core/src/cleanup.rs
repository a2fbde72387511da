//! Scoped release of everything a build creates.
//!
//! [`Cleanup`] is acquired when the working tree is created. Containers and
//! intermediate images are registered as soon as they exist, and released
//! either explicitly or, at the latest, when the guard is dropped, so early
//! returns and panics never leak them. Failures are reported as warnings
//! and never replace the build's own outcome.

use kiln_fs::{remove_dir, WorkingTree};
use kiln_runtime::ContainerEngine;
use kiln_schema::ContainerId;
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub struct Cleanup<'a> {
    engine: &'a dyn ContainerEngine,
    working_dir: PathBuf,
    preserve: bool,
    containers: RefCell<Vec<ContainerId>>,
    images: RefCell<Vec<String>>,
    done: Cell<bool>,
}

impl<'a> Cleanup<'a> {
    pub fn new(engine: &'a dyn ContainerEngine, tree: &WorkingTree, preserve: bool) -> Self {
        Self {
            engine,
            working_dir: tree.root().to_path_buf(),
            preserve,
            containers: RefCell::new(Vec::new()),
            images: RefCell::new(Vec::new()),
            done: Cell::new(false),
        }
    }

    pub fn track_container(&self, id: &ContainerId) {
        self.containers.borrow_mut().push(id.clone());
    }

    /// Register an intermediate image for removal at the end of the build.
    pub fn track_image(&self, image: &str) {
        self.images.borrow_mut().push(image.to_owned());
    }

    /// Remove a tracked container now. Returns a warning on failure.
    pub fn release_container(&self, id: &ContainerId) -> Option<String> {
        let tracked = {
            let mut containers = self.containers.borrow_mut();
            let before = containers.len();
            containers.retain(|c| c != id);
            containers.len() != before
        };
        if !tracked {
            return None;
        }
        self.remove_container(id)
    }

    /// Stop any still-running containers.
    pub fn stop_containers(&self) {
        for id in self.containers.borrow().iter() {
            if let Err(e) = self.engine.stop(id) {
                debug!("stopping container {}: {e}", id.short());
            }
        }
    }

    fn remove_container(&self, id: &ContainerId) -> Option<String> {
        debug!("removing container {}", id.short());
        match self.engine.remove_container(id) {
            Ok(()) => None,
            Err(e) => Some(format!("failed to remove container {}: {e}", id.short())),
        }
    }

    /// Release everything still held and remove the working directory
    /// unless it is to be preserved. Safe to call more than once.
    pub fn run(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let containers: Vec<ContainerId> = self.containers.borrow_mut().drain(..).collect();
        for id in &containers {
            warnings.extend(self.remove_container(id));
        }

        let images: Vec<String> = self.images.borrow_mut().drain(..).collect();
        for image in &images {
            debug!("removing intermediate image {image}");
            if let Err(e) = self.engine.remove_image(image) {
                warnings.push(format!("failed to remove intermediate image {image}: {e}"));
            }
        }

        if self.preserve {
            if !self.done.get() {
                info!(
                    "temporary directory {} will be saved, not deleted",
                    self.working_dir.display()
                );
            }
        } else if let Err(e) = remove_dir(&self.working_dir) {
            warnings.push(format!(
                "failed to remove working directory {}: {e}",
                self.working_dir.display()
            ));
        }

        for w in &warnings {
            warn!("{w}");
        }
        self.done.set(true);
        warnings
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if !self.done.get() {
            self.run();
        }
    }
}
