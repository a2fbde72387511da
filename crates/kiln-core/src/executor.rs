//! Standard build strategy and the container lifecycle shared with the
//! layered strategy.

use crate::cleanup::Cleanup;
use crate::concurrency::CancelToken;
use crate::labels::output_labels;
use crate::scripts::{ScriptName, ScriptSet};
use crate::CoreError;
use kiln_fs::{pack_dir, pack_dir_under, remove_dir, unpack, FsError, WorkingTree};
use kiln_runtime::{
    pipe, CommitSpec, ContainerEngine, ContainerSpec, ImageInfo, PipeReader, PipeWriter,
    RuntimeError,
};
use kiln_schema::{BuildRequest, ContainerId, ImageId, PullPolicy, RegistryAuth, SourceInfo};
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunks in flight between archive producer and consumer.
pub const PIPE_CAPACITY: usize = 16;

/// Output lines kept for the error of a failed script.
const OUTPUT_TAIL_LINES: usize = 50;

const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Everything one build's executor needs, resolved before any container is
/// created.
pub struct BuildSession<'a> {
    pub engine: &'a dyn ContainerEngine,
    pub request: &'a BuildRequest,
    pub tree: &'a WorkingTree,
    pub scripts: &'a ScriptSet,
    pub source: &'a SourceInfo,
    pub env: BTreeMap<String, String>,
    pub user: String,
    pub cleanup: &'a Cleanup<'a>,
    pub cancel: &'a CancelToken,
    pub messages: &'a mut Vec<String>,
    /// Id of the previous output image, once an incremental build found it.
    pub previous_image: Option<ImageId>,
}

impl BuildSession<'_> {
    pub fn destination(&self) -> &str {
        self.request.destination.trim_end_matches('/')
    }

    pub fn script_path(&self, name: ScriptName) -> Result<String, CoreError> {
        self.scripts
            .container_path(name, self.destination())
            .ok_or_else(|| CoreError::ScriptResolution {
                missing: vec![name.to_string()],
            })
    }

    pub fn container_spec(&self, image: &str, command: Vec<String>) -> ContainerSpec {
        ContainerSpec {
            image: image.to_owned(),
            command,
            user: Some(self.user.clone()),
            network: self.request.network_mode.engine_arg(),
            env: self.env.clone(),
            working_dir: Some(format!("{}/src", self.destination())),
        }
    }

    pub fn warn(&mut self, message: String) {
        warn!("{message}");
        self.messages.push(message);
    }
}

/// Make `image` available locally according to `policy`, pulling with
/// `auth` when a pull is needed.
///
/// Returns the image and, when an `always` pull failed but a local copy
/// could be used instead, a warning.
pub fn ensure_image(
    engine: &dyn ContainerEngine,
    image: &str,
    policy: PullPolicy,
    auth: Option<&RegistryAuth>,
) -> Result<(ImageInfo, Option<String>), CoreError> {
    match policy {
        PullPolicy::Never => match engine.inspect_image(image)? {
            Some(info) => Ok((info, None)),
            None => Err(CoreError::Engine(RuntimeError::ImageNotFound(format!(
                "{image} (pull policy is never)"
            )))),
        },
        PullPolicy::IfNotPresent => match engine.inspect_image(image)? {
            Some(info) => {
                debug!("using local image {image}");
                Ok((info, None))
            }
            None => {
                info!("pulling image {image}");
                Ok((engine.pull(image, auth)?, None))
            }
        },
        PullPolicy::Always => {
            info!("pulling image {image}");
            match engine.pull(image, auth) {
                Ok(info) => Ok((info, None)),
                Err(e) => match engine.inspect_image(image)? {
                    Some(info) => Ok((
                        info,
                        Some(format!("pull of {image} failed, using local image: {e}")),
                    )),
                    None => Err(e.into()),
                },
            }
        }
    }
}

/// Join an archive producer and a consumer with a bounded pipe.
///
/// The producer runs on its own thread and blocks when the pipe is full.
/// A producer failure reaches the consumer as a read error; a consumer
/// failure reaches the producer as a broken pipe. The first real cause is
/// returned.
pub fn stream_archive<P, C, T>(produce: P, consume: C) -> Result<T, CoreError>
where
    P: FnOnce(&mut PipeWriter) -> Result<(), FsError> + Send,
    C: FnOnce(&mut PipeReader) -> Result<T, RuntimeError>,
{
    let (mut writer, mut reader) = pipe(PIPE_CAPACITY);
    std::thread::scope(|scope| {
        let producer = scope.spawn(move || match produce(&mut writer) {
            Ok(()) => writer.finish().map_err(FsError::from),
            Err(e) => {
                writer.fail(&e);
                Err(e)
            }
        });
        let consumed = consume(&mut reader);
        drop(reader);
        let produced = producer.join().unwrap_or_else(|_| {
            Err(FsError::Io(io::Error::other("archive producer panicked")))
        });
        match (produced, consumed) {
            (Err(p), _) if !is_broken_pipe(&p) => Err(CoreError::Fs(p)),
            (_, Err(c)) => Err(CoreError::Engine(c)),
            (Err(p), Ok(_)) => Err(CoreError::Fs(p)),
            (Ok(()), Ok(value)) => Ok(value),
        }
    })
}

fn is_broken_pipe(err: &FsError) -> bool {
    matches!(err, FsError::Io(e) if e.kind() == io::ErrorKind::BrokenPipe)
}

/// Start a created container, stream its output to the log and wait for
/// it to exit. Output is fully drained before the exit code is returned.
/// Cancellation stops the container and yields `Cancelled`.
pub fn run_script(
    session: &BuildSession<'_>,
    id: &ContainerId,
    script: ScriptName,
) -> Result<(i64, String), CoreError> {
    let engine = session.engine;
    let cancel = session.cancel;
    let quiet = session.request.quiet;

    engine.start(id)?;
    let output = engine.attach_output(id)?;
    let finished = AtomicBool::new(false);

    let (waited, tail) = std::thread::scope(|scope| {
        let drain = scope.spawn(move || drain_output(output, quiet));
        let finished = &finished;
        let watchdog = scope.spawn(move || {
            while !finished.load(Ordering::SeqCst) {
                if cancel.is_cancelled() {
                    warn!("cancellation requested, stopping container {}", id.short());
                    if let Err(e) = engine.stop(id) {
                        debug!("stop after cancellation: {e}");
                    }
                    return;
                }
                std::thread::sleep(CANCEL_POLL);
            }
        });
        let waited = engine.wait(id);
        finished.store(true, Ordering::SeqCst);
        let tail = drain.join().unwrap_or_default();
        let _ = watchdog.join();
        (waited, tail)
    });

    cancel.check()?;
    let code = waited?;
    debug!("{script} exited with code {code}");
    Ok((code, tail))
}

/// Log every output line as it arrives and keep the last few.
fn drain_output(output: Box<dyn Read + Send>, quiet: bool) -> String {
    let mut tail: VecDeque<String> = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
    let mut reader = BufReader::new(output);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                if quiet {
                    debug!(target: "kiln::assemble", "{line}");
                } else {
                    info!(target: "kiln::assemble", "{line}");
                }
                if tail.len() == OUTPUT_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line.to_owned());
            }
            Err(e) => {
                debug!("output stream ended: {e}");
                break;
            }
        }
    }
    Vec::from(tail).join("\n")
}

/// Restore artifacts of the previous output image into `upload/artifacts`.
///
/// Any failure downgrades the build to non-incremental with a warning;
/// only cancellation is propagated.
pub fn restore_artifacts(session: &mut BuildSession<'_>) -> Result<(), CoreError> {
    let previous = session.request.tag.clone();
    match try_restore(session, &previous) {
        Ok(()) => {
            info!("restored artifacts from {previous}");
            Ok(())
        }
        Err(CoreError::Cancelled) => Err(CoreError::Cancelled),
        Err(e) => {
            let _ = remove_dir(&session.tree.artifacts_dir());
            session.previous_image = None;
            session.warn(format!(
                "clean build will be performed: could not restore artifacts from {previous}: {e}"
            ));
            Ok(())
        }
    }
}

fn try_restore(session: &mut BuildSession<'_>, previous: &str) -> Result<(), CoreError> {
    let (image, warning) = ensure_image(
        session.engine,
        previous,
        session.request.previous_image_pull_policy,
        session.request.previous_image_pull_auth.as_ref(),
    )?;
    if let Some(w) = warning {
        session.warn(w);
    }
    session.previous_image = Some(image.id.clone());

    let artifacts = format!("{}/artifacts", session.destination());
    let command = vec![session.script_path(ScriptName::SaveArtifacts)?, artifacts.clone()];
    let spec = session.container_spec(previous, command);
    let id = session.engine.create_container(&spec)?;
    session.cleanup.track_container(&id);

    let result = save_and_extract(session, &id, &artifacts);
    if let Some(w) = session.cleanup.release_container(&id) {
        session.warn(w);
    }
    result
}

fn save_and_extract(
    session: &BuildSession<'_>,
    id: &ContainerId,
    artifacts: &str,
) -> Result<(), CoreError> {
    if session.scripts.has_staged() {
        let scripts_dir = session.tree.scripts_dir();
        stream_archive(
            move |w| pack_dir_under(&scripts_dir, "scripts", w).map(|_| ()),
            |r| session.engine.copy_in(id, r, session.destination()),
        )?;
    }

    let (code, output) = run_script(session, id, ScriptName::SaveArtifacts)?;
    if code != 0 {
        return Err(CoreError::AssembleFailed {
            script: ScriptName::SaveArtifacts.to_string(),
            code,
            output,
        });
    }

    let stream = session.engine.extract_path(id, artifacts)?;
    unpack(stream, &session.tree.artifacts_dir(), 1)?;
    Ok(())
}

/// Commit a container whose script exited with `code`, or fail with the
/// script's output. The container is removed either way.
pub fn finish(
    session: &mut BuildSession<'_>,
    id: &ContainerId,
    code: i64,
    output: String,
) -> Result<ImageId, CoreError> {
    if code != 0 {
        if let Some(w) = session.cleanup.release_container(id) {
            session.warn(w);
        }
        return Err(CoreError::AssembleFailed {
            script: ScriptName::Assemble.to_string(),
            code,
            output,
        });
    }

    let spec = CommitSpec {
        tag: session.request.tag.clone(),
        labels: output_labels(session.request, session.source),
        env: session.env.clone(),
        cmd: vec![session.script_path(ScriptName::Run)?],
        user: Some(session.user.clone()),
        clear_entrypoint: true,
    };
    let committed = session.engine.commit(id, &spec);
    if let Some(w) = session.cleanup.release_container(id) {
        session.warn(w);
    }
    let image = committed?;
    info!("committed {} as {}", session.request.tag, image.short());
    Ok(image)
}

/// Standard strategy: upload scripts, source and artifacts into a builder
/// container, run assemble there and commit the container.
pub fn execute(session: &mut BuildSession<'_>) -> Result<ImageId, CoreError> {
    if session.request.incremental {
        restore_artifacts(session)?;
    }
    session.cancel.check()?;

    let assemble = session.script_path(ScriptName::Assemble)?;
    let spec = session.container_spec(&session.request.builder_image, vec![assemble]);
    let id = session.engine.create_container(&spec)?;
    session.cleanup.track_container(&id);
    debug!("created build container {}", id.short());

    let upload = session.tree.upload_dir();
    let engine = session.engine;
    let destination = session.destination().to_owned();
    stream_archive(
        move |w| pack_dir(&upload, w).map(|_| ()),
        |r| engine.copy_in(&id, r, &destination),
    )?;
    session.cancel.check()?;

    info!("running {}", ScriptName::Assemble);
    let (code, output) = run_script(session, &id, ScriptName::Assemble)?;
    finish(session, &id, code, output)
}
