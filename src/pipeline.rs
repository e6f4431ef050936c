use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::context::{Context, ContextValue, ServiceResult};
use crate::contract::Contract;
use crate::failure::{DefinitionError, PipelineError};
use crate::model;
use crate::observability::{MetricsCollector, RunOutcome, StepTimer};
use crate::policy::{self, guardian_check};
use crate::step::{StepDescriptor, StepHandle, StepLogic};
use crate::transaction::{NoopUnitOfWork, UnitOfWork};
use crate::validation::check_definition;

/// Declares the ordered steps of a pipeline.
pub struct PipelineBuilder {
    name: String,
    steps: Vec<StepDescriptor>,
    unit_of_work: Arc<dyn UnitOfWork>,
    metrics: Option<MetricsCollector>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            unit_of_work: Arc::new(NoopUnitOfWork),
            metrics: None,
        }
    }

    pub fn add_step(mut self, descriptor: StepDescriptor) -> Self {
        self.steps.push(descriptor);
        self
    }

    pub fn contract(self, schema: Contract) -> Self {
        self.add_step(StepDescriptor::contract(schema))
    }

    pub fn policy<F>(self, name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        self.add_step(StepDescriptor::policy(name, predicate))
    }

    /// Policy named after `permission`, answered by the context's guardian.
    pub fn guardian_policy(self, permission: impl Into<String>) -> Self {
        let permission = permission.into();
        let predicate = guardian_check(permission.clone());
        self.add_step(StepDescriptor::from_parts(
            permission,
            StepLogic::Policy(predicate),
        ))
    }

    pub fn model<F, V>(self, name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(&Context) -> Option<V> + Send + Sync + 'static,
        V: Into<ContextValue> + 'static,
    {
        self.model_with(name, fetch, true)
    }

    pub fn optional_model<F, V>(self, name: impl Into<String>, fetch: F) -> Self
    where
        F: Fn(&Context) -> Option<V> + Send + Sync + 'static,
        V: Into<ContextValue> + 'static,
    {
        self.model_with(name, fetch, false)
    }

    pub fn model_with<F, V>(self, name: impl Into<String>, fetch: F, required: bool) -> Self
    where
        F: Fn(&Context) -> Option<V> + Send + Sync + 'static,
        V: Into<ContextValue> + 'static,
    {
        self.add_step(StepDescriptor::model(
            name,
            move |ctx: &Context| fetch(ctx).map(Into::into),
            required,
        ))
    }

    pub fn step<F>(self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
    {
        self.add_step(StepDescriptor::step(name, body))
    }

    pub fn step_with_rollback<F, R>(self, name: impl Into<String>, body: F, rollback: R) -> Self
    where
        F: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
        R: Fn(&mut Context) -> Result<()> + Send + Sync + 'static,
    {
        self.add_step(StepDescriptor::step(name, body).with_rollback(rollback))
    }

    pub fn transaction<F>(self, build: F) -> Self
    where
        F: FnOnce(PipelineBuilder) -> PipelineBuilder,
    {
        self.named_transaction("transaction", build)
    }

    pub fn named_transaction<F>(self, name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(PipelineBuilder) -> PipelineBuilder,
    {
        let name = name.into();
        let nested = build(PipelineBuilder::new(name.clone()));
        self.add_step(StepDescriptor::transaction(name, nested.steps))
    }

    pub fn unit_of_work(mut self, unit_of_work: Arc<dyn UnitOfWork>) -> Self {
        self.unit_of_work = unit_of_work;
        self
    }

    /// Records run and step metrics into `metrics`. Without a collector the
    /// engine keeps no state between invocations.
    pub fn metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<Pipeline, DefinitionError> {
        let errors = check_definition(&self.steps);
        if !errors.is_empty() {
            return Err(DefinitionError::Invalid {
                name: self.name,
                errors,
            });
        }
        Ok(Pipeline {
            name: self.name,
            steps: self.steps,
            unit_of_work: self.unit_of_work,
            metrics: self.metrics,
        })
    }
}

/// Fatal error escaping a step, before it is wrapped for the caller.
struct Fatal {
    step: String,
    source: anyhow::Error,
}

impl Fatal {
    fn new(step: &str, source: anyhow::Error) -> Self {
        Self {
            step: step.to_string(),
            source,
        }
    }
}

enum Flow {
    Continue,
    Halt,
}

/// An immutable, reusable pipeline definition.
///
/// Every invocation gets its own [`Context`], so one `Pipeline` can be run
/// from many threads at once.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    steps: Vec<StepDescriptor>,
    unit_of_work: Arc<dyn UnitOfWork>,
    metrics: Option<MetricsCollector>,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    pub fn metrics(&self) -> Option<&MetricsCollector> {
        self.metrics.as_ref()
    }

    /// Runs with a fresh context. Expected failures come back as a failed
    /// [`ServiceResult`]; only fatal errors are returned as `Err`.
    pub fn run<I, K, V>(&self, input: I) -> Result<ServiceResult, PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ContextValue>,
    {
        self.call(Context::new(input))
    }

    /// Like [`Pipeline::run`], but expected failures are returned as
    /// [`PipelineError::Failed`] carrying this invocation's context.
    pub fn run_strict<I, K, V>(&self, input: I) -> Result<ServiceResult, PipelineError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<ContextValue>,
    {
        self.call_strict(Context::new(input))
    }

    /// Runs against a caller-built context.
    ///
    /// The context must be fresh: one that already failed, ran steps or was
    /// rolled back is returned untouched as [`PipelineError::ContextReused`].
    pub fn call(&self, mut ctx: Context) -> Result<ServiceResult, PipelineError> {
        if ctx.is_spent() {
            warn!(
                pipeline = self.name.as_str(),
                run_id = %ctx.run_id(),
                "Refusing reused context"
            );
            return Err(PipelineError::ContextReused {
                pipeline: self.name.clone(),
                context: Box::new(ctx),
            });
        }

        let span = tracing::span!(
            tracing::Level::INFO,
            "pipeline",
            pipeline = self.name.as_str(),
            run_id = %ctx.run_id()
        );
        let _span_guard = span.enter();
        let started = Instant::now();

        match self.run_steps(&self.steps, &mut ctx) {
            Ok(_) => {
                let outcome = match ctx.failure_reason() {
                    Some(reason) => {
                        info!(kind = reason.kind(), reason = %reason, "Pipeline failed");
                        RunOutcome::Failure
                    }
                    None => {
                        info!(steps = ctx.called_steps().len(), "Pipeline succeeded");
                        RunOutcome::Success
                    }
                };
                if let Some(metrics) = &self.metrics {
                    metrics.record_run(&self.name, outcome, started.elapsed());
                }
                Ok(ServiceResult::new(ctx))
            }
            Err(Fatal { step, source }) => {
                error!(step = step.as_str(), error = %source, "Fatal error, rolling back");
                ctx.clear_failure();
                self.compensate(&mut ctx);
                if let Some(metrics) = &self.metrics {
                    metrics.record_run(&self.name, RunOutcome::Fatal, started.elapsed());
                }
                Err(PipelineError::Fatal {
                    pipeline: self.name.clone(),
                    step,
                    source,
                    context: Box::new(ctx),
                })
            }
        }
    }

    pub fn call_strict(&self, ctx: Context) -> Result<ServiceResult, PipelineError> {
        let result = self.call(ctx)?;
        match result.failure_reason().cloned() {
            Some(reason) => Err(PipelineError::Failed {
                pipeline: self.name.clone(),
                reason,
                context: Box::new(result.into_context()),
            }),
            None => Ok(result),
        }
    }

    fn run_steps(&self, steps: &[StepDescriptor], ctx: &mut Context) -> Result<Flow, Fatal> {
        for step in steps {
            if let Flow::Halt = self.run_step(step, ctx)? {
                return Ok(Flow::Halt);
            }
        }
        Ok(Flow::Continue)
    }

    fn run_step(&self, step: &StepDescriptor, ctx: &mut Context) -> Result<Flow, Fatal> {
        let span = tracing::span!(
            tracing::Level::DEBUG,
            "step",
            step = step.name(),
            kind = step.kind().as_str()
        );
        let _span_guard = span.enter();
        let mut timer = self
            .metrics
            .as_ref()
            .map(|metrics| metrics.start_step(&self.name, step.name()));

        match &step.logic {
            StepLogic::Contract(schema) => match schema.validate(&*ctx) {
                Ok(values) => {
                    for (key, value) in values {
                        ctx.set(key, value);
                    }
                }
                Err(violations) => {
                    if let Some(first) = violations.first() {
                        ctx.fail(first.clone().into());
                    }
                    debug!(violations = violations.len(), "Contract rejected input");
                    ctx.record_violations(violations);
                }
            },
            StepLogic::Policy(predicate) => {
                policy::evaluate(step.name(), predicate, ctx);
            }
            StepLogic::Model { fetch, required } => {
                model::resolve(step.name(), fetch, *required, ctx);
            }
            StepLogic::Step { body, .. } => {
                ctx.enter_step(step.name());
                let outcome = body(&mut *ctx);
                ctx.leave_step();
                if let Err(source) = outcome {
                    mark_failed(&mut timer);
                    return Err(Fatal::new(step.name(), source));
                }
            }
            StepLogic::Transaction(nested) => {
                if let Err(fatal) = self.run_transaction(step.name(), nested, ctx) {
                    mark_failed(&mut timer);
                    return Err(fatal);
                }
            }
        }

        if ctx.is_failure() {
            mark_failed(&mut timer);
            return Ok(Flow::Halt);
        }
        ctx.record_called(step.handle());
        Ok(Flow::Continue)
    }

    fn run_transaction(
        &self,
        name: &str,
        steps: &[StepDescriptor],
        ctx: &mut Context,
    ) -> Result<(), Fatal> {
        self.unit_of_work
            .begin()
            .map_err(|source| Fatal::new(name, source))?;

        match self.run_steps(steps, ctx) {
            Ok(_) if ctx.is_failure() => {
                debug!(transaction = name, "Rolling back unit of work after failure");
                self.unit_of_work
                    .rollback()
                    .map_err(|source| Fatal::new(name, source))
            }
            Ok(_) => self
                .unit_of_work
                .commit()
                .map_err(|source| Fatal::new(name, source)),
            Err(fatal) => {
                if let Err(err) = self.unit_of_work.rollback() {
                    warn!(transaction = name, error = %err, "Unit of work rollback failed");
                }
                Err(fatal)
            }
        }
    }

    /// Runs registered rollbacks of every called step, newest first.
    fn compensate(&self, ctx: &mut Context) {
        let handles: Vec<StepHandle> = ctx
            .called_steps()
            .iter()
            .rev()
            .filter(|handle| handle.has_rollback())
            .cloned()
            .collect();

        for handle in &handles {
            let Some(rollback) = handle.rollback() else {
                continue;
            };
            debug!(step = handle.name(), "Running rollback");
            if let Err(err) = rollback(&mut *ctx) {
                warn!(step = handle.name(), error = %err, "Rollback failed");
            }
        }
        ctx.mark_rolled_back();
        if let Some(metrics) = &self.metrics {
            metrics.record_rollback(&self.name);
        }
    }
}

fn mark_failed(timer: &mut Option<StepTimer>) {
    if let Some(timer) = timer {
        timer.mark_failed();
    }
}
