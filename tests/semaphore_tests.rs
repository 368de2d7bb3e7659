//! Integration tests for `BackPressureSemaphore`.

use pipelinekit::{BackPressureSemaphore, OverflowStrategy, Priority, SemaphoreConfig};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

#[compio::test]
async fn basic_acquire_release() {
    compio::time::timeout(Duration::from_secs(5), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        let token = sem.try_acquire().unwrap();
        assert_eq!(sem.stats().available, 0);
        drop(token);
        assert_eq!(sem.stats().available, 1);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn concurrent_access_is_bounded() {
    compio::time::timeout(Duration::from_secs(10), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(5));
        let mut handles = Vec::new();

        for i in 0..20 {
            let sem = sem.clone();
            handles.push(compio::runtime::spawn(async move {
                let _token = sem.acquire(Priority::Normal, 1).await.unwrap();
                compio::time::sleep(Duration::from_millis(10)).await;
                i
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i);
        }

        assert_eq!(sem.stats().available, 5);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn try_acquire_fails_once_exhausted() {
    compio::time::timeout(Duration::from_secs(5), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));

        let token1 = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());

        drop(token1);
        assert!(sem.try_acquire().is_some());
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn a_released_permit_wakes_the_oldest_waiter() {
    compio::time::timeout(Duration::from_secs(5), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        let held = sem.try_acquire().unwrap();

        let waiting = sem.clone();
        let handle = compio::runtime::spawn(async move {
            let _token = waiting.acquire(Priority::Normal, 1).await.unwrap();
            "acquired"
        });

        compio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        let result = compio::time::timeout(Duration::from_millis(100), handle).await;
        assert_eq!(result.unwrap().unwrap(), "acquired");
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn equal_priority_waiters_are_granted_fifo() {
    compio::time::timeout(Duration::from_secs(10), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        let held = sem.try_acquire().unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let sem = sem.clone();
            let order = Arc::clone(&order);
            handles.push(compio::runtime::spawn(async move {
                let _token = sem.acquire(Priority::Normal, 1).await.unwrap();
                order.lock().unwrap().push(i);
            }));
        }

        compio::time::sleep(Duration::from_millis(50)).await;
        drop(held);

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn cancelling_the_middle_waiter_preserves_order_of_the_rest() {
    compio::time::timeout(Duration::from_secs(10), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(1));
        let held = sem.try_acquire().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let spawn_waiter = |label: i32| {
            let sem = sem.clone();
            let order = Arc::clone(&order);
            compio::runtime::spawn(async move {
                let _token = sem.acquire(Priority::Normal, 1).await.unwrap();
                order.lock().unwrap().push(label);
            })
        };

        // Enqueue W1, W2, then the doomed W3, then W4, W5 — sleeping
        // between each spawn so insertion order (and so FIFO tie-break
        // order) matches this sequence exactly.
        let w1 = spawn_waiter(1);
        compio::time::sleep(Duration::from_millis(10)).await;
        let w2 = spawn_waiter(2);
        compio::time::sleep(Duration::from_millis(10)).await;

        let sem3 = sem.clone();
        let w3 = compio::runtime::spawn(async move {
            let _ = sem3.acquire(Priority::Normal, 1).await;
        });
        compio::time::sleep(Duration::from_millis(10)).await;

        let w4 = spawn_waiter(4);
        compio::time::sleep(Duration::from_millis(10)).await;
        let w5 = spawn_waiter(5);
        compio::time::sleep(Duration::from_millis(10)).await;

        w3.cancel().await;
        drop(held);

        w1.await.unwrap();
        w2.await.unwrap();
        w4.await.unwrap();
        w5.await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 4, 5]);
        assert_eq!(sem.stats().available, 1);
        assert_eq!(sem.stats().queued_count, 0);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn stress_many_tasks_share_a_small_pool() {
    compio::time::timeout(Duration::from_secs(10), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(100));
        let mut handles = Vec::new();

        for i in 0..1000 {
            let sem = sem.clone();
            handles.push(compio::runtime::spawn(async move {
                let _token = sem.acquire(Priority::Normal, 1).await.unwrap();
                i * 2
            }));
        }

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await.unwrap(), i * 2);
        }

        assert_eq!(sem.stats().available, 100);
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn drop_oldest_evicts_the_lowest_priority_waiter_first() {
    compio::time::timeout(Duration::from_secs(5), async {
        let config = SemaphoreConfig::new(1)
            .with_max_outstanding(2)
            .with_strategy(OverflowStrategy::DropOldest);
        let sem = BackPressureSemaphore::new(config);
        let _held = sem.try_acquire().unwrap();

        let low = sem.clone();
        let low_handle = compio::runtime::spawn(async move { low.acquire(Priority::Low, 1).await });
        compio::time::sleep(Duration::from_millis(10)).await;

        let _critical = sem.acquire(Priority::Critical, 1).await;

        let low_result = low_handle.await.unwrap();
        assert!(low_result.is_err());
    })
    .await
    .expect("test timed out");
}

#[compio::test]
async fn stats_report_queue_depth() {
    compio::time::timeout(Duration::from_secs(5), async {
        let sem = BackPressureSemaphore::new(SemaphoreConfig::new(50));
        let stats = sem.stats();
        assert_eq!(stats.max_concurrency, 50);
        assert_eq!(stats.available, 50);
        assert_eq!(stats.active_count, 0);

        let _token1 = sem.try_acquire().unwrap();
        let stats = sem.stats();
        assert_eq!(stats.available, 49);
        assert_eq!(stats.active_count, 1);
    })
    .await
    .expect("test timed out");
}
