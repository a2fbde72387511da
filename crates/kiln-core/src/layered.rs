//! Layered build strategy.
//!
//! For builder images that cannot take an upload and run it, scripts and
//! source are baked into an intermediate image with a generated recipe, and
//! assemble runs in a container created from that image. The intermediate
//! image is removed by cleanup.

use crate::executor::{finish, restore_artifacts, run_script, stream_archive, BuildSession};
use crate::scripts::ScriptName;
use crate::CoreError;
use kiln_fs::pack_build_context;
use kiln_schema::ImageId;
use tracing::{debug, info};

/// Tag prefix of intermediate images.
pub const INTERMEDIATE_PREFIX: &str = "kiln-layered-";

/// Image-build recipe layering `upload/` onto `builder` at `destination`.
pub fn recipe(builder: &str, destination: &str, user: Option<&str>, assemble: &str) -> String {
    let destination = destination.trim_end_matches('/');
    let mut recipe = format!(
        "FROM {builder}\nCOPY upload/ {destination}/\nWORKDIR {destination}/src\n"
    );
    if let Some(user) = user.filter(|u| !u.is_empty()) {
        recipe.push_str(&format!("USER {user}\n"));
    }
    recipe.push_str(&format!("ENTRYPOINT [{assemble:?}]\n"));
    recipe
}

pub fn execute(session: &mut BuildSession<'_>) -> Result<ImageId, CoreError> {
    if session.request.incremental {
        restore_artifacts(session)?;
    }
    session.cancel.check()?;

    let assemble = session.script_path(ScriptName::Assemble)?;
    let text = recipe(
        &session.request.builder_image,
        session.destination(),
        session.request.assemble_user.as_deref(),
        &assemble,
    );
    debug!("layered recipe:\n{text}");

    let tag = format!("{INTERMEDIATE_PREFIX}{}", session.tree.id());
    info!("building intermediate image {tag}");
    let upload = session.tree.upload_dir();
    let engine = session.engine;
    let built = stream_archive(
        move |w| pack_build_context(&upload, &text, w).map(|_| ()),
        |r| engine.build_image(&tag, r),
    )?;
    session.cleanup.track_image(&tag);
    debug!("intermediate image {}", built.short());
    session.cancel.check()?;

    let spec = session.container_spec(&tag, vec![assemble]);
    let id = session.engine.create_container(&spec)?;
    session.cleanup.track_container(&id);

    info!("running {}", ScriptName::Assemble);
    let (code, output) = run_script(session, &id, ScriptName::Assemble)?;
    finish(session, &id, code, output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_layers_upload_and_sets_entrypoint() {
        let text = recipe("ruby:2.7-onbuild", "/tmp/", Some("1001"), "/tmp/scripts/assemble");
        assert_eq!(
            text,
            "FROM ruby:2.7-onbuild\n\
             COPY upload/ /tmp/\n\
             WORKDIR /tmp/src\n\
             USER 1001\n\
             ENTRYPOINT [\"/tmp/scripts/assemble\"]\n"
        );
    }

    #[test]
    fn recipe_omits_user_when_unset() {
        let text = recipe("node:onbuild", "/opt/app", None, "/usr/libexec/kiln/assemble");
        assert!(!text.contains("USER"));
        assert!(text.contains("COPY upload/ /opt/app/\n"));
    }
}
