use crate::cleanup::Cleanup;
use crate::concurrency::CancelToken;
use crate::environment::build_environment;
use crate::executor::{self, ensure_image, run_script, stream_archive, BuildSession};
use crate::scripts::{self, required_scripts, ScriptName};
use crate::source;
use crate::strategy::{strategy_for, Strategy};
use crate::validate::{check_user, resolve_user, validate_request};
use crate::{layered, CoreError};
use kiln_fs::{pack_dir_under, WorkingTree};
use kiln_runtime::{http, ContainerEngine, SourceControl};
use kiln_schema::{BuildRequest, BuildResult, ImageId, SchemaError, SourceInfo};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, info_span, warn};

/// A build that did not succeed: the error, plus the result surface with
/// every message gathered up to the failure.
#[derive(Debug)]
pub struct BuildFailure {
    pub error: CoreError,
    pub result: BuildResult,
}

impl fmt::Display for BuildFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for BuildFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Central entry point turning a [`BuildRequest`] into an output image.
///
/// Each call owns a fresh working tree and only drives containers it
/// created itself; cleanup runs on every return path.
pub struct Builder {
    engine: Arc<dyn ContainerEngine>,
    vcs: Arc<dyn SourceControl>,
    cancel: CancelToken,
    work_base: PathBuf,
}

impl Builder {
    pub fn new(engine: Arc<dyn ContainerEngine>, vcs: Arc<dyn SourceControl>) -> Self {
        Self {
            engine,
            vcs,
            cancel: CancelToken::new(),
            work_base: std::env::temp_dir(),
        }
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Directory under which unique working trees are created.
    #[must_use]
    pub fn with_work_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.work_base = base.into();
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Build `request`, returning the result surface either way.
    pub fn build(&self, request: &BuildRequest) -> BuildResult {
        self.run(request).unwrap_or_else(|failure| failure.result)
    }

    /// Build `request`. On failure the error is returned alongside the
    /// result surface.
    pub fn run(&self, request: &BuildRequest) -> Result<BuildResult, BuildFailure> {
        let span = info_span!("build", tag = %request.tag);
        let _enter = span.enter();

        let mut messages = Vec::new();
        let (outcome, working_dir) =
            self.with_working_tree(request, &mut messages, |tree, cleanup, messages| {
                self.execute(request, tree, cleanup, messages)
            });

        let mut result = match &outcome {
            Ok(image) => BuildResult::succeeded(image.clone(), working_dir, messages),
            Err(e) => BuildResult::failed(e, working_dir, messages),
        };
        if let Some(url) = request.callback_url.as_deref() {
            notify(url, &mut result);
        }

        match outcome {
            Ok(image) => {
                info!("build of {} succeeded: {}", request.tag, image.short());
                Ok(result)
            }
            Err(error) => {
                warn!("build of {} failed: {error}", request.tag);
                Err(BuildFailure { error, result })
            }
        }
    }

    /// Run the builder image's usage script and stream its output. Nothing
    /// is committed.
    pub fn usage(&self, request: &BuildRequest) -> Result<BuildResult, BuildFailure> {
        let span = info_span!("usage", image = %request.builder_image);
        let _enter = span.enter();

        let mut messages = Vec::new();
        let (outcome, working_dir) =
            self.with_working_tree(request, &mut messages, |tree, cleanup, messages| {
                self.run_usage(request, tree, cleanup, messages)
            });
        let result = BuildResult {
            success: outcome.is_ok(),
            messages,
            working_dir,
            image_id: None,
        };
        match outcome {
            Ok(()) => Ok(result),
            Err(error) => {
                let result = BuildResult::failed(&error, result.working_dir, result.messages);
                Err(BuildFailure { error, result })
            }
        }
    }

    /// Create the working tree, run `f` with a cleanup guard over it, then
    /// release everything and collect cleanup warnings.
    fn with_working_tree<T>(
        &self,
        request: &BuildRequest,
        messages: &mut Vec<String>,
        f: impl FnOnce(&WorkingTree, &Cleanup<'_>, &mut Vec<String>) -> Result<T, CoreError>,
    ) -> (Result<T, CoreError>, PathBuf) {
        let tree = match self.create_tree(request) {
            Ok(tree) => tree,
            Err(e) => return (Err(e), PathBuf::new()),
        };
        info!("working directory {}", tree.root().display());

        let cleanup = Cleanup::new(&*self.engine, &tree, request.preserve_working_dir);
        let outcome = f(&tree, &cleanup, messages);
        if self.cancel.is_cancelled() {
            cleanup.stop_containers();
        }
        messages.extend(cleanup.run());
        (outcome, tree.root().to_path_buf())
    }

    fn create_tree(&self, request: &BuildRequest) -> Result<WorkingTree, CoreError> {
        match &request.working_dir {
            Some(dir) => {
                let tree = WorkingTree::new(dir);
                tree.reset()?;
                Ok(tree)
            }
            None => Ok(WorkingTree::create_unique(&self.work_base, &request.tag)?),
        }
    }

    fn execute(
        &self,
        request: &BuildRequest,
        tree: &WorkingTree,
        cleanup: &Cleanup<'_>,
        messages: &mut Vec<String>,
    ) -> Result<ImageId, CoreError> {
        validate_request(request)?;
        self.cancel.check()?;

        let source = source::acquire(request, tree, &*self.vcs)?;
        self.cancel.check()?;

        let (builder, warning) = ensure_image(
            &*self.engine,
            &request.builder_image,
            request.effective_builder_pull_policy(),
            request.builder_pull_auth.as_ref(),
        )?;
        messages.extend(warning);

        let scripts = scripts::resolve(request, tree, &builder)?;
        scripts.require(&required_scripts(request))?;

        let user = resolve_user(request, &builder);
        check_user(&request.allowed_uids, &user)?;
        let env = build_environment(request, &tree.source_dir())?;

        let strategy = strategy_for(request);
        info!("using {strategy} strategy with {}", request.builder_image);

        let mut session = BuildSession {
            engine: &*self.engine,
            request,
            tree,
            scripts: &scripts,
            source: &source,
            env,
            user,
            cleanup,
            cancel: &self.cancel,
            messages,
            previous_image: None,
        };
        let image = match strategy {
            Strategy::Standard => executor::execute(&mut session)?,
            Strategy::Layered => layered::execute(&mut session)?,
        };

        if request.incremental && request.remove_previous_image {
            if let Some(previous) = session.previous_image.take() {
                remove_previous(&mut session, &previous, &image);
            }
        }
        Ok(image)
    }

    fn run_usage(
        &self,
        request: &BuildRequest,
        tree: &WorkingTree,
        cleanup: &Cleanup<'_>,
        messages: &mut Vec<String>,
    ) -> Result<(), CoreError> {
        if request.builder_image.trim().is_empty() {
            return Err(SchemaError::MissingField("builder_image").into());
        }

        let (builder, warning) = ensure_image(
            &*self.engine,
            &request.builder_image,
            request.effective_builder_pull_policy(),
            request.builder_pull_auth.as_ref(),
        )?;
        messages.extend(warning);

        let scripts = scripts::resolve(request, tree, &builder)?;
        scripts.require(&[ScriptName::Usage])?;
        let user = resolve_user(request, &builder);
        check_user(&request.allowed_uids, &user)?;
        let env = build_environment(request, &tree.source_dir())?;
        let source = SourceInfo::default();

        let mut session = BuildSession {
            engine: &*self.engine,
            request,
            tree,
            scripts: &scripts,
            source: &source,
            env,
            user,
            cleanup,
            cancel: &self.cancel,
            messages,
            previous_image: None,
        };

        let usage = session.script_path(ScriptName::Usage)?;
        let spec = session.container_spec(&request.builder_image, vec![usage]);
        let id = session.engine.create_container(&spec)?;
        cleanup.track_container(&id);

        if scripts.has_staged() {
            let scripts_dir = tree.scripts_dir();
            stream_archive(
                move |w| pack_dir_under(&scripts_dir, "scripts", w).map(|_| ()),
                |r| session.engine.copy_in(&id, r, session.destination()),
            )?;
        }

        let (code, output) = run_script(&session, &id, ScriptName::Usage)?;
        if let Some(w) = cleanup.release_container(&id) {
            session.messages.push(w);
        }
        if code != 0 {
            return Err(CoreError::AssembleFailed {
                script: ScriptName::Usage.to_string(),
                code,
                output,
            });
        }
        Ok(())
    }
}

fn remove_previous(session: &mut BuildSession<'_>, previous: &ImageId, current: &ImageId) {
    if previous == current {
        return;
    }
    info!("removing previous image {}", previous.short());
    if let Err(e) = session.engine.remove_image(previous) {
        session.warn(format!(
            "failed to remove previous image {}: {e}",
            previous.short()
        ));
    }
}

/// Report the result to `url`. A failed delivery becomes a warning.
fn notify(url: &str, result: &mut BuildResult) {
    let body = serde_json::json!({
        "success": result.success,
        "imageId": result.image_id,
        "messages": result.messages,
    });
    if let Err(e) = http::post_json(url, &body) {
        let message = format!("failed to notify {url}: {e}");
        warn!("{message}");
        // A failed build's error stays the last message.
        let at = if result.success {
            result.messages.len()
        } else {
            result.messages.len().saturating_sub(1)
        };
        result.messages.insert(at, message);
    }
}
