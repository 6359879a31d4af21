/// Runs the wrapped closure exactly once, when the guard goes out of scope.
///
/// Used to tear down in-flight markers on every exit path of a job, including panics.
#[must_use = "the closure runs immediately if the guard is not bound"]
pub struct CallOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> CallOnDrop<F> {
    pub fn new(f: F) -> Self {
        Self(Some(f))
    }
}

impl<F: FnOnce()> Drop for CallOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f()
        }
    }
}
