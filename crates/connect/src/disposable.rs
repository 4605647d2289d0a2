// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Chain Contributors

// Ordered teardown of the resources a chain owns

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::connector::{ForwardedPort, HopClient, ShellChannel};

/// What a stacked resource is, for grouped teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Client,
    Forward,
    Shell,
}

/// Something a chain must release exactly once
#[async_trait]
pub trait Disposable: Send + Sync {
    fn kind(&self) -> ResourceKind;

    fn describe(&self) -> String;

    async fn dispose(&self);
}

/// SSH session of one hop
pub struct ClientResource(pub Arc<dyn HopClient>);

#[async_trait]
impl Disposable for ClientResource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Client
    }

    fn describe(&self) -> String {
        self.0.describe()
    }

    async fn dispose(&self) {
        self.0.disconnect().await;
    }
}

/// Forward listener (hop tunnel or attached forward)
pub struct ForwardResource(pub Box<dyn ForwardedPort>);

#[async_trait]
impl Disposable for ForwardResource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Forward
    }

    fn describe(&self) -> String {
        self.0.describe()
    }

    async fn dispose(&self) {
        self.0.stop().await;
    }
}

/// Primary shell of the target hop
pub struct ShellResource(pub Arc<dyn ShellChannel>);

#[async_trait]
impl Disposable for ShellResource {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Shell
    }

    fn describe(&self) -> String {
        "primary shell".to_string()
    }

    async fn dispose(&self) {
        self.0.close().await;
    }
}

/// Resources in construction order
#[derive(Default)]
pub struct ResourceStack {
    items: Vec<Box<dyn Disposable>>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: impl Disposable + 'static) {
        debug!("Acquired {:?}: {}", item.kind(), item.describe());
        self.items.push(Box::new(item));
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Descriptions of resources of one kind, in construction order
    pub fn describe_kind(&self, kind: ResourceKind) -> Vec<String> {
        self.items
            .iter()
            .filter(|item| item.kind() == kind)
            .map(|item| item.describe())
            .collect()
    }

    /// Dispose everything in strict reverse construction order
    pub async fn unwind(&mut self) {
        while let Some(item) = self.items.pop() {
            debug!("Releasing {:?}: {}", item.kind(), item.describe());
            item.dispose().await;
        }
    }

    /// Dispose resources of one kind, newest first, keeping the others
    pub async fn unwind_kind(&mut self, kind: ResourceKind) {
        let mut index = self.items.len();
        while index > 0 {
            index -= 1;
            if self.items[index].kind() == kind {
                let item = self.items.remove(index);
                debug!("Releasing {:?}: {}", item.kind(), item.describe());
                item.dispose().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        kind: ResourceKind,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Disposable for Recorder {
        fn kind(&self) -> ResourceKind {
            self.kind
        }

        fn describe(&self) -> String {
            self.name.to_string()
        }

        async fn dispose(&self) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn stack(log: &Arc<Mutex<Vec<&'static str>>>) -> ResourceStack {
        let mut stack = ResourceStack::new();
        for (name, kind) in [
            ("c1", ResourceKind::Client),
            ("f1", ResourceKind::Forward),
            ("c2", ResourceKind::Client),
            ("shell", ResourceKind::Shell),
            ("f2", ResourceKind::Forward),
        ] {
            stack.push(Recorder {
                name,
                kind,
                log: log.clone(),
            });
        }
        stack
    }

    #[tokio::test]
    async fn test_unwind_is_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = stack(&log);
        stack.unwind().await;
        assert!(stack.is_empty());
        assert_eq!(*log.lock().unwrap(), vec!["f2", "shell", "c2", "f1", "c1"]);
    }

    #[tokio::test]
    async fn test_unwind_by_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stack = stack(&log);
        assert_eq!(stack.describe_kind(ResourceKind::Forward), vec!["f1", "f2"]);

        stack.unwind_kind(ResourceKind::Shell).await;
        stack.unwind_kind(ResourceKind::Forward).await;
        assert_eq!(stack.len(), 2);
        stack.unwind_kind(ResourceKind::Client).await;
        assert_eq!(*log.lock().unwrap(), vec!["shell", "f2", "f1", "c2", "c1"]);
    }
}
