/// Receives sample data as transfers complete
///
/// Called synchronously from the event loop, once per completed transfer, in
/// completion order. The chunk borrows a transfer buffer that is resubmitted
/// right after the call returns, so it cannot be kept. Return `false` to end
/// the recording.
///
/// Implementations must not block: every in-flight transfer waits on the
/// thread that runs the callback.
pub trait DataCallback {
    fn on_data(&mut self, chunk: &[u8]) -> bool;
}

impl<F> DataCallback for F
where
    F: FnMut(&[u8]) -> bool,
{
    fn on_data(&mut self, chunk: &[u8]) -> bool {
        self(chunk)
    }
}
