use anyhow::Result;

/// Host-supplied transactional boundary used by transaction groups.
///
/// The engine calls `begin` before the group's first step, `commit` when the
/// whole group succeeded and `rollback` when it failed or raised. An error
/// from any of these calls is fatal for the invocation.
pub trait UnitOfWork: Send + Sync {
    fn begin(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn rollback(&self) -> Result<()>;
}

/// Unit of work for hosts without a transactional store.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUnitOfWork;

impl UnitOfWork for NoopUnitOfWork {
    fn begin(&self) -> Result<()> {
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        Ok(())
    }
}
