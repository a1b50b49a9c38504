//! Service groups - the runners that make up one app

use super::ProcessRunner;
use crate::error::SupervisorError;
use parking_lot::Mutex;
use perch_core::{AppStatusReply, Status, StatusDetail, aggregate_status};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One service within a group
pub struct GroupMember {
    pub service: String,
    pub default: bool,
    pub depends_on: Vec<String>,
    pub runner: Arc<ProcessRunner>,
}

/// Ordered set of runners for one app.
///
/// Members are kept in dependency order (dependencies first), so starting
/// walks the list forwards and stopping walks it backwards. An app with a
/// single command is an *implicit* group of one member.
pub struct ServiceGroup {
    app: String,
    implicit: bool,
    members: Vec<GroupMember>,
    idle_timeout: Option<Duration>,
    last_activity: Mutex<Instant>,
}

impl ServiceGroup {
    pub fn new(
        app: impl Into<String>,
        implicit: bool,
        members: Vec<GroupMember>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            app: app.into(),
            implicit,
            members,
            idle_timeout,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    pub fn member(&self, service: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.service == service)
    }

    pub fn status(&self) -> Status {
        aggregate_status(self.members.iter().map(|m| m.runner.status()))
    }

    pub fn is_active(&self) -> bool {
        self.members.iter().any(|m| m.runner.is_active())
    }

    /// Start every member in dependency order.
    ///
    /// Keeps going after a failure so independent services still come up;
    /// the first error is returned.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        self.touch();
        let mut first_err = None;
        for member in &self.members {
            if let Err(e) = member.runner.start().await {
                tracing::warn!(app = %self.app, service = %member.service, "Start failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Stop every member, dependents first.
    pub async fn stop_all(&self) {
        for member in self.members.iter().rev() {
            member.runner.stop().await;
        }
    }

    /// Stop everything (reverse order) then start everything (forward order).
    pub async fn restart_all(&self) -> Result<(), SupervisorError> {
        self.stop_all().await;
        self.start_all().await
    }

    /// Start one service, bringing up its dependencies first.
    pub async fn start_service(&self, service: &str) -> Result<(), SupervisorError> {
        self.touch();
        for member in self.dependency_chain(service) {
            member.runner.start().await?;
        }
        Ok(())
    }

    /// Restart one service. Dependencies are started if needed, not restarted.
    pub async fn restart_service(&self, service: &str) -> Result<(), SupervisorError> {
        self.touch();
        let chain = self.dependency_chain(service);
        let Some((target, deps)) = chain.split_last() else {
            return Ok(());
        };
        for member in deps {
            member.runner.start().await?;
        }
        target.runner.restart().await?;
        Ok(())
    }

    /// Members `service` transitively depends on, in start order, ending
    /// with `service` itself. Cycles are cut where they are found.
    pub fn dependency_chain(&self, service: &str) -> Vec<&GroupMember> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        self.visit(service, &mut seen, &mut order);
        order
    }

    fn visit<'a>(
        &'a self,
        service: &str,
        seen: &mut HashSet<String>,
        order: &mut Vec<&'a GroupMember>,
    ) {
        if !seen.insert(service.to_string()) {
            return;
        }
        let Some(member) = self.member(service) else {
            return;
        };
        for dep in &member.depends_on {
            self.visit(dep, seen, order);
        }
        order.push(member);
    }

    /// Clear every failed member. Returns true if anything changed.
    pub fn clear_failures(&self) -> bool {
        self.members
            .iter()
            .fold(false, |acc, m| m.runner.clear_failure() | acc)
    }

    /// Status reply for the whole group
    pub fn status_reply(&self) -> AppStatusReply {
        if self.implicit {
            if let Some(member) = self.members.first() {
                return AppStatusReply::from(&member.runner.detail());
            }
        }
        match self.status() {
            Status::Failed => {
                let error = self
                    .members
                    .iter()
                    .find_map(|m| {
                        m.runner
                            .detail()
                            .error()
                            .map(|e| format!("{}: {e}", m.service))
                    })
                    .unwrap_or_default();
                AppStatusReply {
                    status: Status::Failed,
                    error: Some(error),
                }
            }
            status => AppStatusReply {
                status,
                error: None,
            },
        }
    }

    /// Status reply for one service, accounting for its dependencies: a
    /// running service whose dependency is not yet up still reports
    /// starting, and a failed dependency reports failed.
    pub fn service_status_reply(&self, service: &str) -> AppStatusReply {
        let Some(member) = self.member(service) else {
            return AppStatusReply::idle();
        };
        let detail = member.runner.detail();
        if !matches!(detail, StatusDetail::Running { .. }) {
            return AppStatusReply::from(&detail);
        }

        let chain = self.dependency_chain(service);
        for dep in chain.iter().filter(|m| m.service != service) {
            match dep.runner.detail() {
                StatusDetail::Running { .. } => {}
                StatusDetail::Failed { error } => {
                    return AppStatusReply {
                        status: Status::Failed,
                        error: Some(format!("dependency {} failed: {error}", dep.service)),
                    };
                }
                _ => {
                    return AppStatusReply {
                        status: Status::Starting,
                        error: None,
                    };
                }
            }
        }
        AppStatusReply::from(&detail)
    }

    /// Record activity for idle tracking.
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// Active and untouched for longer than the idle timeout
    pub fn idle_expired(&self) -> bool {
        match self.idle_timeout {
            Some(limit) => self.is_active() && self.last_activity.lock().elapsed() >= limit,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instances::{LaunchOptions, PortAllocator, RunnerEvent, ServiceSpec};
    use crate::logs::LogBuffer;
    use tokio::sync::mpsc;

    fn runner(key: &str, command: &str, tx: &mpsc::Sender<RunnerEvent>) -> Arc<ProcessRunner> {
        let spec = ServiceSpec {
            command: command.to_string(),
            dir: std::env::temp_dir(),
            ready_pattern: Some("up".to_string()),
            ..Default::default()
        };
        let options = LaunchOptions {
            shell: "/bin/sh".to_string(),
            readiness_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(20),
            stop_grace: Duration::from_secs(2),
        };
        Arc::new(ProcessRunner::new(
            key,
            spec,
            Arc::new(LogBuffer::new(50)),
            options,
            Arc::new(PortAllocator::new(50000..60000)),
            tx.clone(),
        ))
    }

    fn member(service: &str, deps: &[&str], command: &str, tx: &mpsc::Sender<RunnerEvent>) -> GroupMember {
        GroupMember {
            service: service.to_string(),
            default: false,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            runner: runner(&format!("{service}-shop"), command, tx),
        }
    }

    async fn settle(group: &ServiceGroup) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while group.members().iter().any(|m| m.runner.status() == Status::Starting) {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn dependency_chain_is_deps_first() {
        let (tx, _rx) = mpsc::channel(64);
        let group = ServiceGroup::new(
            "shop",
            false,
            vec![
                member("db", &[], "true", &tx),
                member("api", &["db"], "true", &tx),
                member("web", &["api"], "true", &tx),
            ],
            None,
        );
        let chain: Vec<_> = group
            .dependency_chain("web")
            .iter()
            .map(|m| m.service.as_str())
            .collect();
        assert_eq!(chain, vec!["db", "api", "web"]);
    }

    #[test]
    fn dependency_cycle_terminates() {
        let (tx, _rx) = mpsc::channel(64);
        let group = ServiceGroup::new(
            "shop",
            false,
            vec![member("a", &["b"], "true", &tx), member("b", &["a"], "true", &tx)],
            None,
        );
        assert_eq!(group.dependency_chain("a").len(), 2);
    }

    #[tokio::test]
    async fn start_service_brings_up_dependencies() {
        let (tx, _rx) = mpsc::channel(256);
        let group = ServiceGroup::new(
            "shop",
            false,
            vec![
                member("db", &[], "echo up; sleep 30", &tx),
                member("api", &["db"], "echo up; sleep 30", &tx),
                member("web", &[], "echo up; sleep 30", &tx),
            ],
            None,
        );

        group.start_service("api").await.unwrap();
        settle(&group).await;
        assert_eq!(group.member("db").unwrap().runner.status(), Status::Running);
        assert_eq!(group.member("api").unwrap().runner.status(), Status::Running);
        assert_eq!(group.member("web").unwrap().runner.status(), Status::Idle);
        assert_eq!(group.status(), Status::Running);

        group.stop_all().await;
        assert_eq!(group.status(), Status::Idle);
    }

    #[tokio::test]
    async fn failed_member_names_service_in_error() {
        let (tx, _rx) = mpsc::channel(256);
        let group = ServiceGroup::new(
            "shop",
            false,
            vec![
                member("db", &[], "exit 1", &tx),
                member("web", &[], "echo up; sleep 30", &tx),
            ],
            None,
        );

        group.start_all().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while group.status() != Status::Failed {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let reply = group.status_reply();
        assert_eq!(reply.status, Status::Failed);
        assert!(reply.error.unwrap().starts_with("db: "));

        // web depends on nothing and stays up
        settle(&group).await;
        assert_eq!(group.member("web").unwrap().runner.status(), Status::Running);

        assert!(group.clear_failures());
        assert_eq!(group.member("db").unwrap().runner.status(), Status::Idle);
        group.stop_all().await;
    }

    #[tokio::test]
    async fn service_status_reports_failed_dependency() {
        let (tx, _rx) = mpsc::channel(256);
        let group = ServiceGroup::new(
            "shop",
            false,
            vec![
                member("db", &[], "exit 1", &tx),
                member("api", &["db"], "echo up; sleep 30", &tx),
            ],
            None,
        );

        group.start_all().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while group.member("db").unwrap().runner.status() != Status::Failed
            || group.member("api").unwrap().runner.status() != Status::Running
        {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let reply = group.service_status_reply("api");
        assert_eq!(reply.status, Status::Failed);
        assert!(reply.error.unwrap().contains("dependency db failed"));
        group.stop_all().await;
    }

    #[tokio::test]
    async fn idle_expiry_needs_activity_gap() {
        let (tx, _rx) = mpsc::channel(256);
        let group = ServiceGroup::new(
            "shop",
            true,
            vec![member("shop", &[], "echo up; sleep 30", &tx)],
            Some(Duration::from_millis(100)),
        );
        assert!(!group.idle_expired());

        group.start_all().await.unwrap();
        assert!(!group.idle_expired());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(group.idle_expired());

        group.touch();
        assert!(!group.idle_expired());
        group.stop_all().await;
    }
}
