//! Middleware applied to decoded domain events before they are broadcast.

use std::sync::Arc;

use tracing::trace;

use crate::events::DomainEvent;

/// One pipeline stage. Returning `None` drops the event.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, event: DomainEvent) -> Option<DomainEvent>;
}

/// Adapter turning a closure into a `Middleware`.
pub struct FnMiddleware<F> {
    name: String,
    f: F,
}

impl<F> FnMiddleware<F>
where
    F: Fn(DomainEvent) -> Option<DomainEvent> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(DomainEvent) -> Option<DomainEvent> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, event: DomainEvent) -> Option<DomainEvent> {
        (self.f)(event)
    }
}

/// Ordered middleware stages.
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Arc<dyn Middleware>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run `event` through every stage in order, stopping at the first drop.
    pub fn apply(&self, event: DomainEvent) -> Option<DomainEvent> {
        let mut event = event;
        for stage in &self.stages {
            match stage.handle(event) {
                Some(next) => event = next,
                None => {
                    trace!("event dropped by middleware {}", stage.name());
                    return None;
                }
            }
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventKind, TypingEvent};

    fn typing(from: &str) -> DomainEvent {
        DomainEvent::Typing(TypingEvent {
            is_typing: true,
            from: from.into(),
            thread_id: from.into(),
        })
    }

    #[test]
    fn test_empty_pipeline_passes_through() {
        let pipeline = Pipeline::new();
        assert_eq!(pipeline.apply(typing("1")), Some(typing("1")));
    }

    #[test]
    fn test_stages_run_in_order() {
        let mut pipeline = Pipeline::new();
        pipeline.push(Arc::new(FnMiddleware::new("rewrite", |event: DomainEvent| match event {
            DomainEvent::Typing(mut t) => {
                t.from = format!("{}-a", t.from);
                Some(DomainEvent::Typing(t))
            }
            other => Some(other),
        })));
        pipeline.push(Arc::new(FnMiddleware::new("drop-a", |event: DomainEvent| {
            let dropped = matches!(&event, DomainEvent::Typing(t) if t.from == "2-a");
            if dropped {
                None
            } else {
                Some(event)
            }
        })));
        assert_eq!(pipeline.len(), 2);

        let out = pipeline.apply(typing("1")).unwrap();
        assert_eq!(out.kind(), EventKind::Typing);
        assert!(matches!(out, DomainEvent::Typing(ref t) if t.from == "1-a"));
        assert!(pipeline.apply(typing("2")).is_none());
    }
}
