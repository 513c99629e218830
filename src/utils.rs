#[cfg(test)]
use tokio::task::JoinHandle;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxResult<T> = Result<T, BoxError>;

/// make sure to abort a task on drop, so that a test failing halfway
/// doesn't leave a server running and holding its port
#[cfg(test)]
pub(crate) struct AbortHdl<T>(pub(crate) JoinHandle<T>);

#[cfg(test)]
impl<T> Drop for AbortHdl<T> {
    fn drop(&mut self) {
        self.0.abort()
    }
}
