use camino::Utf8Path;

use crate::core::TaskKey;
use crate::engine::Task;
use crate::engine::session::Session;
use crate::error::EngineError;
use crate::stamp::{OutputStamper, Resource, ResourceStamper};
use crate::store::Dependency;

/// The mediator handed to a running task body.
///
/// Everything the body observes through the context is recorded as a
/// dependency of the running task. The recorded list stays local to the
/// context and only reaches the session if the body returns `Ok`, so a failed
/// or cancelled execution leaves no trace in the store.
pub struct ExecContext<'s, T: Task> {
    session: &'s Session<'s, T>,
    key: TaskKey,
    /// Keys currently being required along this call chain, ending with `key`.
    lineage: &'s [TaskKey],
    dependencies: Vec<Dependency>,
    span: tracing::Span,
}

impl<'s, T: Task> ExecContext<'s, T> {
    pub(crate) fn new(
        session: &'s Session<'s, T>,
        key: TaskKey,
        lineage: &'s [TaskKey],
        span: tracing::Span,
    ) -> Self {
        Self {
            session,
            key,
            lineage,
            dependencies: Vec::new(),
            span,
        }
    }

    /// Key of the task this context belongs to.
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Tracing span of the running task.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Requires `task` and records a dependency on its whole output.
    pub fn require(&mut self, task: &T) -> Result<T::Output, EngineError> {
        self.require_with(task, OutputStamper::Equals)
    }

    /// Requires `task`, recording its output with the given stamper.
    pub fn require_with(&mut self, task: &T, stamper: OutputStamper) -> Result<T::Output, EngineError> {
        let key = TaskKey::of(task)?;
        let output = self.session.require_keyed(task, &key, self.lineage)?;
        let stamp = stamper.stamp(&output)?;

        self.dependencies.push(Dependency::Call {
            key,
            stamper,
            stamp,
        });

        Ok(output)
    }

    /// Reads an external resource, recording its stamp.
    pub fn require_resource(
        &mut self,
        path: impl AsRef<Utf8Path>,
        stamper: ResourceStamper,
    ) -> Result<Resource, EngineError> {
        self.session.check_cancelled()?;

        let path = path.as_ref().to_owned();
        let stamp = stamper.stamp(&path);

        tracing::trace!("{} reads {} ({:?})", self.key, path, stamp);

        self.dependencies.push(Dependency::Resource {
            path: path.clone(),
            stamper,
            stamp,
        });

        Ok(Resource::new(path, stamp))
    }

    /// Declares the running task the only writer of `path` in this session.
    pub fn provide(&mut self, path: impl AsRef<Utf8Path>) -> Result<(), EngineError> {
        let path = path.as_ref();
        self.session.register_provider(path, &self.key)?;

        self.dependencies.push(Dependency::Provide {
            path: path.to_owned(),
        });

        Ok(())
    }

    pub(crate) fn into_dependencies(self) -> Vec<Dependency> {
        self.dependencies
    }
}
