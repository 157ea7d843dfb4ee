/// Diagnostics sink threaded explicitly through tree building and layout
/// computation. Callers that want per-field trace output pass `Some(&mut
/// Trace)`; everything else pays nothing.
#[derive(Debug, Default)]
pub struct Trace {
    events: Vec<String>,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    pub fn note(&mut self, event: impl Into<String>) {
        self.events.push(event.into());
    }

    pub fn events(&self) -> &[String] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub(crate) fn note(trace: &mut Option<&mut Trace>, f: impl FnOnce() -> String) {
    if let Some(t) = trace.as_deref_mut() {
        t.note(f());
    }
}
