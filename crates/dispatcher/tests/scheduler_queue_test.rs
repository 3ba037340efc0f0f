//! 调度队列契约测试，FIFO 与窗口队列共用同一组用例

use std::sync::Arc;
use std::time::Duration;

use darkstar_core::{current_time_millis, Identity, KernelRunnable, SchedulerError};
use darkstar_dispatcher::{ScheduledTask, SchedulerQueue};
use darkstar_testing_utils::CountingRunnable;

fn runnable() -> Arc<dyn KernelRunnable> {
    CountingRunnable::new()
}

fn task() -> Arc<ScheduledTask> {
    delayed_task(0)
}

fn delayed_task(delay_ms: i64) -> Arc<ScheduledTask> {
    Arc::new(ScheduledTask::new(
        runnable(),
        Identity::system(),
        current_time_millis() + delay_ms,
    ))
}

fn recurring_task() -> Arc<ScheduledTask> {
    Arc::new(ScheduledTask::recurring(
        runnable(),
        Identity::system(),
        current_time_millis(),
        100,
    ))
}

macro_rules! scheduler_queue_tests {
    ($module:ident, $queue:ty) => {
        mod $module {
            use super::*;

            fn queue() -> Arc<dyn SchedulerQueue> {
                <$queue>::new()
            }

            #[tokio::test]
            async fn test_reserve_tasks() {
                let queue = queue();
                for delay in [0, 100, 0, 50] {
                    queue.reserve_task(delayed_task(delay)).unwrap();
                }
                assert_eq!(queue.get_ready_count(), 0);
            }

            #[tokio::test]
            async fn test_use_reserved_task() {
                let queue = queue();
                let reservation = queue.reserve_task(task()).unwrap();
                reservation.use_reservation().unwrap();
                assert!(reservation.is_finished());
                assert_eq!(queue.get_ready_count(), 1);
            }

            #[tokio::test]
            async fn test_cancel_reserved_task() {
                let queue = queue();
                let reservation = queue.reserve_task(task()).unwrap();
                reservation.cancel().unwrap();
                assert!(reservation.task().is_cancelled());
                assert_eq!(queue.get_ready_count(), 0);
                assert!(queue.get_next_task(false).await.is_none());
            }

            #[tokio::test]
            async fn test_reservation_is_single_use() {
                let queue = queue();

                let reservation = queue.reserve_task(task()).unwrap();
                reservation.use_reservation().unwrap();
                assert!(matches!(
                    reservation.use_reservation(),
                    Err(SchedulerError::IllegalState(_))
                ));
                assert!(matches!(
                    reservation.cancel(),
                    Err(SchedulerError::IllegalState(_))
                ));

                let reservation = queue.reserve_task(delayed_task(100)).unwrap();
                reservation.cancel().unwrap();
                assert!(matches!(
                    reservation.cancel(),
                    Err(SchedulerError::IllegalState(_))
                ));
                assert!(matches!(
                    reservation.use_reservation(),
                    Err(SchedulerError::IllegalState(_))
                ));

                assert_eq!(queue.get_ready_count(), 1);
            }

            #[tokio::test]
            async fn test_reserve_recurring_task_rejected() {
                let queue = queue();
                assert!(matches!(
                    queue.reserve_task(recurring_task()),
                    Err(SchedulerError::TaskRejected(_))
                ));
            }

            #[tokio::test]
            async fn test_recurring_handle_requires_recurring_task() {
                let queue = queue();
                assert!(matches!(
                    queue.create_recurring_task_handle(task()),
                    Err(SchedulerError::InvalidArgument(_))
                ));
            }

            #[tokio::test]
            async fn test_recurring_handle_lifecycle() {
                let queue = queue();

                let handle = queue.create_recurring_task_handle(recurring_task()).unwrap();
                handle.start().unwrap();
                assert!(matches!(handle.start(), Err(SchedulerError::IllegalState(_))));
                handle.cancel().unwrap();
                assert!(matches!(handle.cancel(), Err(SchedulerError::IllegalState(_))));

                let handle = queue.create_recurring_task_handle(recurring_task()).unwrap();
                handle.cancel().unwrap();
                assert!(matches!(handle.start(), Err(SchedulerError::IllegalState(_))));
            }

            #[tokio::test]
            async fn test_add_and_consume_task() {
                let queue = queue();
                let task = task();
                queue.add_task(task.clone()).unwrap();
                let next = queue.get_next_task(false).await.unwrap();
                assert!(Arc::ptr_eq(&task, &next));
                assert!(queue.get_next_task(false).await.is_none());
            }

            #[tokio::test]
            async fn test_add_and_consume_task_waiting() {
                let queue = queue();
                queue.add_task(task()).unwrap();
                let next = tokio::time::timeout(
                    Duration::from_millis(100),
                    queue.get_next_task(true),
                )
                .await
                .unwrap();
                assert!(next.is_some());
            }

            #[tokio::test]
            async fn test_add_and_consume_tasks() {
                let queue = queue();
                for _ in 0..3 {
                    queue.add_task(task()).unwrap();
                }
                assert!(queue.get_next_task(false).await.is_some());
                assert!(queue.get_next_task(false).await.is_some());
                assert!(queue.get_next_task(false).await.is_some());
                assert!(queue.get_next_task(false).await.is_none());

                for _ in 0..6 {
                    queue.add_task(task()).unwrap();
                }
                let mut tasks = Vec::new();
                assert_eq!(queue.get_next_tasks(&mut tasks, 10), 6);
                assert_eq!(tasks.len(), 6);
            }

            #[tokio::test]
            async fn test_reserve_and_consume_tasks() {
                let queue = queue();
                queue.reserve_task(task()).unwrap().use_reservation().unwrap();
                queue.reserve_task(task()).unwrap().cancel().unwrap();
                queue.reserve_task(delayed_task(100)).unwrap().use_reservation().unwrap();
                queue.reserve_task(delayed_task(120)).unwrap().cancel().unwrap();
                queue.reserve_task(delayed_task(140)).unwrap().use_reservation().unwrap();

                let consume = async {
                    assert!(queue.get_next_task(false).await.is_some());
                    assert!(queue.get_next_task(false).await.is_none());
                    assert!(queue.get_next_task(true).await.is_some());
                    assert!(queue.get_next_task(true).await.is_some());
                    assert!(queue.get_next_task(false).await.is_none());
                };
                tokio::time::timeout(Duration::from_millis(500), consume)
                    .await
                    .unwrap();
            }

            #[tokio::test]
            async fn test_add_and_consume_task_delayed() {
                let queue = queue();
                let task = delayed_task(100);
                queue.add_task(task.clone()).unwrap();
                assert!(queue.get_next_task(false).await.is_none());

                tokio::time::sleep(Duration::from_millis(200)).await;
                let next = queue.get_next_task(false).await.unwrap();
                assert!(Arc::ptr_eq(&task, &next));
            }

            #[tokio::test]
            async fn test_add_and_consume_tasks_delayed() {
                let queue = queue();
                for delay in [100, 100, 120, 110] {
                    queue.add_task(delayed_task(delay)).unwrap();
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                for _ in 0..4 {
                    assert!(queue.get_next_task(false).await.is_some());
                }
                assert!(queue.get_next_task(false).await.is_none());

                for delay in [100, 100, 120, 110, 150] {
                    queue.add_task(delayed_task(delay)).unwrap();
                }
                let mut tasks = Vec::new();
                assert_eq!(queue.get_next_tasks(&mut tasks, 5), 0);
                tokio::time::sleep(Duration::from_millis(200)).await;
                assert_eq!(queue.get_next_tasks(&mut tasks, 3), 3);
                assert_eq!(queue.get_next_tasks(&mut tasks, 3), 2);
            }

            #[tokio::test]
            async fn test_delay_inside_threshold_runs_immediately() {
                let queue = queue();
                queue.add_task(delayed_task(10)).unwrap();
                assert_eq!(queue.get_ready_count(), 1);
            }

            #[tokio::test]
            async fn test_add_and_consume_tasks_recurring() {
                let queue = queue();

                let handle1 = queue.create_recurring_task_handle(recurring_task()).unwrap();
                handle1.start().unwrap();
                let handle2 = queue.create_recurring_task_handle(recurring_task()).unwrap();
                handle2.cancel().unwrap();
                let handle3 = queue.create_recurring_task_handle(recurring_task()).unwrap();
                handle3.start().unwrap();
                handle1.cancel().unwrap();
                handle3.cancel().unwrap();

                // 取消不会把已就绪的任务移出队列
                let mut tasks = Vec::new();
                assert_eq!(queue.get_next_tasks(&mut tasks, 6), 2);
                tokio::time::sleep(Duration::from_millis(150)).await;
                assert!(queue.get_next_task(false).await.is_none());
            }

            #[tokio::test]
            async fn test_cancel_delayed_recurring_task_stops_timer() {
                let queue = queue();
                let task = Arc::new(ScheduledTask::recurring(
                    runnable(),
                    Identity::system(),
                    current_time_millis() + 50,
                    100,
                ));
                let handle = queue.create_recurring_task_handle(task).unwrap();
                handle.start().unwrap();
                handle.cancel().unwrap();

                tokio::time::sleep(Duration::from_millis(150)).await;
                assert!(queue.get_next_task(false).await.is_none());
            }

            #[tokio::test]
            async fn test_add_and_consume_many_tasks() {
                let queue = queue();
                for i in 0..1216i64 {
                    queue.add_task(delayed_task(i % 40)).unwrap();
                }

                tokio::time::sleep(Duration::from_millis(150)).await;
                let mut count = 0;
                while queue.get_next_task(false).await.is_some() {
                    count += 1;
                }
                assert_eq!(count, 1216);
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn test_many_consumers_many_producers() {
                let queue = queue();
                let mut producers = Vec::new();
                for _ in 0..8 {
                    let queue = queue.clone();
                    producers.push(tokio::spawn(async move {
                        for i in 0..50i64 {
                            queue.add_task(delayed_task(i % 30)).unwrap();
                        }
                    }));
                }

                let mut consumers = Vec::new();
                for _ in 0..4 {
                    let queue = queue.clone();
                    consumers.push(tokio::spawn(async move {
                        let mut consumed = 0;
                        for _ in 0..100 {
                            queue.get_next_task(true).await.unwrap();
                            consumed += 1;
                        }
                        consumed
                    }));
                }

                for producer in producers {
                    producer.await.unwrap();
                }
                let mut total = 0;
                for consumer in consumers {
                    total += tokio::time::timeout(Duration::from_secs(5), consumer)
                        .await
                        .unwrap()
                        .unwrap();
                }
                assert_eq!(total, 400);
                assert_eq!(queue.get_ready_count(), 0);
            }

            #[tokio::test]
            async fn test_shutdown_wakes_waiters_and_rejects_tasks() {
                let queue = queue();
                let waiter = {
                    let queue = queue.clone();
                    tokio::spawn(async move { queue.get_next_task(true).await })
                };
                tokio::time::sleep(Duration::from_millis(20)).await;

                queue.shutdown();
                let next = tokio::time::timeout(Duration::from_millis(200), waiter)
                    .await
                    .unwrap()
                    .unwrap();
                assert!(next.is_none());
                assert!(matches!(
                    queue.add_task(task()),
                    Err(SchedulerError::TaskRejected(_))
                ));
            }
        }
    };
}

scheduler_queue_tests!(fifo, darkstar_dispatcher::FifoSchedulerQueue);
scheduler_queue_tests!(window, darkstar_dispatcher::WindowSchedulerQueue);

#[tokio::test]
async fn test_fifo_preserves_ready_order() {
    let queue = darkstar_dispatcher::FifoSchedulerQueue::new();
    let tasks: Vec<_> = (0..5).map(|_| task()).collect();
    for task in &tasks {
        queue.add_task(task.clone()).unwrap();
    }

    for expected in &tasks {
        let next = queue.get_next_task(false).await.unwrap();
        assert!(Arc::ptr_eq(expected, &next));
    }
}

#[tokio::test]
async fn test_window_bounded_unfairness() {
    let queue = darkstar_dispatcher::WindowSchedulerQueue::new();
    let owner_b = Identity::new("b");
    let waiting = Arc::new(ScheduledTask::new(runnable(), owner_b.clone(), current_time_millis()));
    queue.add_task(waiting).unwrap();

    for _ in 0..5 {
        let task = Arc::new(ScheduledTask::new(
            runnable(),
            Identity::new("a"),
            current_time_millis(),
        ));
        queue.add_task(task).unwrap();
    }

    let mut a_before_b = 0;
    loop {
        let next = queue.get_next_task(false).await.unwrap();
        if next.owner() == &owner_b {
            break;
        }
        a_before_b += 1;
    }
    assert!(a_before_b <= 1);
}
