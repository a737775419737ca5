use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resource_group::ResourceGroup;
use super::task::TaskStatus;

/// 按 (资源组, 状态) 分组的任务聚合，供指标计算使用
#[derive(Debug, Clone, PartialEq)]
pub struct TaskAggregate {
    pub resource_group: ResourceGroup,
    pub status: TaskStatus,
    pub count: u64,
    /// 已记录 actual_duration 的任务数
    pub timed_count: u64,
    pub total_duration_ms: u64,
}

/// 单个资源组的统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroupStats {
    pub total_tasks: u64,
    pub pending_tasks: u64,
    pub running_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub success_rate: f64,
    pub average_processing_time_ms: f64,
}

/// 队列指标快照
///
/// 只从任务行派生，不单独维护状态。成功率 = completed / (completed + failed)，
/// 尚无结束任务时为 0。平均处理时间只统计已结束且记录了耗时的任务。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub session_id: String,
    pub snapshot_time: DateTime<Utc>,
    pub total_tasks: u64,
    pub pending_tasks: u64,
    pub running_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub success_rate: f64,
    pub average_processing_time_ms: f64,
    pub throughput_per_minute: f64,
    /// 仅在内存中的快照里携带，不写入持久化
    #[serde(default)]
    pub memory_usage_mb: Option<f64>,
    pub resource_group_stats: BTreeMap<String, ResourceGroupStats>,
}

#[derive(Default)]
struct Tally {
    total: u64,
    pending: u64,
    running: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    timed: u64,
    duration_ms: u64,
}

impl Tally {
    fn add(&mut self, aggregate: &TaskAggregate) {
        self.total += aggregate.count;
        match aggregate.status {
            TaskStatus::Pending => self.pending += aggregate.count,
            TaskStatus::Running => self.running += aggregate.count,
            TaskStatus::Completed => self.completed += aggregate.count,
            TaskStatus::Failed => self.failed += aggregate.count,
            TaskStatus::Cancelled => self.cancelled += aggregate.count,
        }
        if matches!(aggregate.status, TaskStatus::Completed | TaskStatus::Failed) {
            self.timed += aggregate.timed_count;
            self.duration_ms += aggregate.total_duration_ms;
        }
    }

    fn success_rate(&self) -> f64 {
        success_rate(self.completed, self.failed)
    }

    fn average_ms(&self) -> f64 {
        if self.timed == 0 {
            0.0
        } else {
            self.duration_ms as f64 / self.timed as f64
        }
    }
}

pub fn success_rate(completed: u64, failed: u64) -> f64 {
    let finished = completed + failed;
    if finished == 0 {
        0.0
    } else {
        completed as f64 / finished as f64
    }
}

impl QueueMetrics {
    /// 由聚合行计算指标，`recent_finished` 为最近一分钟内结束的任务数
    pub fn from_aggregates(
        session_id: &str,
        snapshot_time: DateTime<Utc>,
        aggregates: &[TaskAggregate],
        recent_finished: u64,
    ) -> Self {
        let mut overall = Tally::default();
        let mut per_group: BTreeMap<ResourceGroup, Tally> = BTreeMap::new();

        for aggregate in aggregates {
            overall.add(aggregate);
            per_group
                .entry(aggregate.resource_group)
                .or_default()
                .add(aggregate);
        }

        let resource_group_stats = per_group
            .into_iter()
            .map(|(group, tally)| {
                let stats = ResourceGroupStats {
                    total_tasks: tally.total,
                    pending_tasks: tally.pending,
                    running_tasks: tally.running,
                    completed_tasks: tally.completed,
                    failed_tasks: tally.failed,
                    cancelled_tasks: tally.cancelled,
                    success_rate: tally.success_rate(),
                    average_processing_time_ms: tally.average_ms(),
                };
                (group.as_str().to_string(), stats)
            })
            .collect();

        Self {
            session_id: session_id.to_string(),
            snapshot_time,
            total_tasks: overall.total,
            pending_tasks: overall.pending,
            running_tasks: overall.running,
            completed_tasks: overall.completed,
            failed_tasks: overall.failed,
            cancelled_tasks: overall.cancelled,
            success_rate: overall.success_rate(),
            average_processing_time_ms: overall.average_ms(),
            throughput_per_minute: recent_finished as f64,
            memory_usage_mb: None,
            resource_group_stats,
        }
    }
}

/// `resource_group_performance` 视图的一行
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroupPerformance {
    pub resource_group: ResourceGroup,
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate(group: ResourceGroup, status: TaskStatus, count: u64, ms: u64) -> TaskAggregate {
        TaskAggregate {
            resource_group: group,
            status,
            count,
            timed_count: if ms > 0 { count } else { 0 },
            total_duration_ms: ms,
        }
    }

    #[test]
    fn test_empty_metrics() {
        let metrics = QueueMetrics::from_aggregates("s", Utc::now(), &[], 0);
        assert_eq!(metrics.total_tasks, 0);
        assert_eq!(metrics.success_rate, 0.0);
        assert_eq!(metrics.average_processing_time_ms, 0.0);
        assert!(metrics.resource_group_stats.is_empty());
    }

    #[test]
    fn test_metrics_from_aggregates() {
        let rows = vec![
            aggregate(ResourceGroup::Filesystem, TaskStatus::Completed, 3, 300),
            aggregate(ResourceGroup::Filesystem, TaskStatus::Failed, 1, 100),
            aggregate(ResourceGroup::Filesystem, TaskStatus::Pending, 2, 0),
            aggregate(ResourceGroup::Network, TaskStatus::Completed, 1, 1000),
            aggregate(ResourceGroup::Network, TaskStatus::Cancelled, 4, 0),
        ];
        let metrics = QueueMetrics::from_aggregates("s", Utc::now(), &rows, 5);

        assert_eq!(metrics.total_tasks, 11);
        assert_eq!(metrics.completed_tasks, 4);
        assert_eq!(metrics.failed_tasks, 1);
        assert_eq!(metrics.pending_tasks, 2);
        assert_eq!(metrics.cancelled_tasks, 4);
        assert!((metrics.success_rate - 0.8).abs() < f64::EPSILON);
        assert!((metrics.average_processing_time_ms - 280.0).abs() < f64::EPSILON);
        assert_eq!(metrics.throughput_per_minute, 5.0);

        let fs = &metrics.resource_group_stats["filesystem"];
        assert_eq!(fs.total_tasks, 6);
        assert!((fs.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((fs.average_processing_time_ms - 100.0).abs() < f64::EPSILON);

        let net = &metrics.resource_group_stats["network"];
        assert_eq!(net.cancelled_tasks, 4);
        assert_eq!(net.success_rate, 1.0);
    }
}
