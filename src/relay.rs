//! Relay worker
//!
//! The single consumer of the [`EventQueue`](crate::queue::EventQueue). Each
//! drain pass takes events off the head one at a time and runs the handler
//! for its kind:
//!
//! - `Purchase`: record the buyer, pull the approved tokens, reserve a locker
//! - `LockerAssigned`: mail the buyer their locker number
//! - `LockerOpened`: mail the buyer a pickup confirmation
//!
//! A failing handler is logged and counted; the pass moves on to the next
//! event. Nothing is retried or rolled back.
//!
//! Chỉ một drain pass được chạy tại một thời điểm: receiver và registry nằm
//! sau một mutex, lấy bằng `try_lock`.

use std::sync::Arc;

use ethers::types::Address;
use metrics::increment_counter;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::chain::VendorChain;
use crate::error::{RelayError, RelayResult};
use crate::notifications::{EmailTemplate, Mailer};
use crate::queue::EventReceiver;
use crate::registry::BuyerRegistry;
use crate::types::{BuyerRecord, QueuedEvent, VendorEvent};

/// Result of a call to [`RelayWorker::drain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain pass holds the worker; nothing was done
    AlreadyDraining,
    /// The queue was emptied. `processed` counts every event taken off it, failures included.
    Drained { processed: usize, failed: usize },
}

struct WorkerState {
    receiver: EventReceiver,
    registry: BuyerRegistry,
}

/// Sequential processor of queued vendor events
pub struct RelayWorker {
    state: Mutex<WorkerState>,
    notify: Arc<Notify>,
    chain: Arc<dyn VendorChain>,
    mailer: Arc<dyn Mailer>,
}

impl RelayWorker {
    /// `notify` must be the queue's notifier so enqueues wake [`run`](Self::run)
    pub fn new(
        receiver: EventReceiver,
        notify: Arc<Notify>,
        chain: Arc<dyn VendorChain>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                receiver,
                registry: BuyerRegistry::new(),
            }),
            notify,
            chain,
            mailer,
        }
    }

    /// Process queued events until the queue is empty
    ///
    /// Returns [`DrainOutcome::AlreadyDraining`] immediately if another pass
    /// is running. Events enqueued during the pass are picked up by the same pass.
    pub async fn drain(&self) -> DrainOutcome {
        let mut guard = match self.state.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Drain already in progress");
                return DrainOutcome::AlreadyDraining;
            }
        };
        let WorkerState { receiver, registry } = &mut *guard;

        let mut processed = 0;
        let mut failed = 0;
        while let Some(event) = receiver.try_next() {
            processed += 1;
            let kind = event.event.kind();
            let span = info_span!("relay_event", id = %event.id, kind, block = ?event.block_number);

            match self.handle(registry, &event).instrument(span).await {
                Ok(()) => {
                    increment_counter!("relay_events_total", "kind" => kind, "outcome" => "processed");
                }
                Err(e) => {
                    failed += 1;
                    error!(event_id = %event.id, error_kind = e.kind(), "Failed to handle {}: {}", event, e);
                    increment_counter!("relay_events_total", "kind" => kind, "outcome" => "failed");
                }
            }
        }

        if processed > 0 {
            info!("Drain pass done: {} processed, {} failed", processed, failed);
        }
        DrainOutcome::Drained { processed, failed }
    }

    /// Wait for enqueue notifications and drain until `shutdown` turns true
    ///
    /// Events still queued at shutdown get one last drain pass.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("Relay worker started");
        loop {
            tokio::select! {
                _ = self.notify.notified() => {
                    self.drain().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        if let DrainOutcome::Drained { processed, .. } = self.drain().await {
            if processed > 0 {
                info!("Drained {} events during shutdown", processed);
            }
        }
        info!("Relay worker stopped");
    }

    /// Copy of the registry entry for `buyer`; waits for any drain in flight
    pub async fn buyer(&self, buyer: &Address) -> Option<BuyerRecord> {
        self.state.lock().await.registry.get(buyer).cloned()
    }

    async fn handle(&self, registry: &mut BuyerRegistry, event: &QueuedEvent) -> RelayResult<()> {
        debug!("Handling {}", event);
        match &event.event {
            VendorEvent::Purchase { buyer, amount, email } => {
                registry.record_purchase(*buyer, *amount, email.clone());

                let pull_tx = self.chain.pull_approved_tokens(*buyer, *amount).await?;
                info!("Pulled {} tokens from {:?}: {:?}", amount, buyer, pull_tx);

                match self.chain.reserve_locker(*buyer).await {
                    Ok(tx) => {
                        info!("Locker reserved for {:?}: {:?}", buyer, tx);
                        Ok(())
                    }
                    Err(e) => {
                        // tokens stay with the vendor, no locker for the buyer
                        error!(
                            buyer = ?buyer,
                            amount = %amount,
                            pull_tx = ?pull_tx,
                            "Orphaned payment: tokens pulled but locker reservation failed"
                        );
                        increment_counter!("relay_orphaned_payments_total");
                        Err(e)
                    }
                }
            }
            VendorEvent::LockerAssigned { buyer, locker_number } => {
                let template = EmailTemplate::LockerReserved {
                    locker_number: *locker_number,
                };
                self.notify_buyer(registry, buyer, &template).await
            }
            VendorEvent::LockerOpened { buyer, locker_number } => {
                let template = EmailTemplate::LockerPickedUp {
                    locker_number: *locker_number,
                };
                self.notify_buyer(registry, buyer, &template).await
            }
        }
    }

    async fn notify_buyer(
        &self,
        registry: &BuyerRegistry,
        buyer: &Address,
        template: &EmailTemplate,
    ) -> RelayResult<()> {
        let record = registry.get(buyer).ok_or_else(|| {
            warn!("No buyer info for {:?}, skipping {} email", buyer, template.name());
            RelayError::MissingBuyerInfo(*buyer)
        })?;

        if let Err(e) = self.mailer.send(&record.email, template).await {
            increment_counter!("relay_mail_failures_total", "template" => template.name());
            return Err(e);
        }
        info!("Sent {} email to {} for {:?}", template.name(), record.email, buyer);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::EventQueue;
    use crate::test_utils::{MockChain, MockMail};
    use crate::types::{LockerNumber, LockerSignature, PermitRequest, TxStatus};
    use async_trait::async_trait;
    use ethers::types::{TxHash, U256};
    use mockall::predicate::eq;
    use mockall::Sequence;
    use test_log::test;

    fn buyer_a() -> Address {
        Address::repeat_byte(0xaa)
    }

    fn purchase(buyer: Address, amount: u64, email: &str) -> QueuedEvent {
        QueuedEvent::new(VendorEvent::Purchase {
            buyer,
            amount: U256::from(amount),
            email: email.to_string(),
        })
    }

    fn assigned(buyer: Address, locker_number: LockerNumber) -> QueuedEvent {
        QueuedEvent::new(VendorEvent::LockerAssigned { buyer, locker_number })
    }

    fn opened(buyer: Address, locker_number: LockerNumber) -> QueuedEvent {
        QueuedEvent::new(VendorEvent::LockerOpened { buyer, locker_number })
    }

    fn worker(chain: MockChain, mail: MockMail) -> (EventQueue, Arc<RelayWorker>) {
        let (queue, receiver) = EventQueue::new();
        let worker = RelayWorker::new(receiver, queue.notifier(), Arc::new(chain), Arc::new(mail));
        (queue, Arc::new(worker))
    }

    #[test(tokio::test)]
    async fn test_purchase_records_buyer_and_reserves_locker() {
        let mut chain = MockChain::new();
        let mut seq = Sequence::new();
        chain
            .expect_pull_approved_tokens()
            .with(eq(buyer_a()), eq(U256::from(500)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(TxHash::repeat_byte(1)));
        chain
            .expect_reserve_locker()
            .with(eq(buyer_a()))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(TxHash::repeat_byte(2)));

        let (queue, worker) = worker(chain, MockMail::new());
        queue.enqueue(purchase(buyer_a(), 500, "a@x.com"));

        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 1, failed: 0 }
        );
        let record = worker.buyer(&buyer_a()).await.unwrap();
        assert_eq!(record.email, "a@x.com");
        assert_eq!(record.purchased_amount, U256::from(500));
    }

    #[test(tokio::test)]
    async fn test_assignment_without_purchase_sends_nothing() {
        let mut mail = MockMail::new();
        mail.expect_send().times(0);

        let (queue, worker) = worker(MockChain::new(), mail);
        queue.enqueue(assigned(buyer_a(), 4));

        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 1, failed: 1 }
        );
    }

    #[test(tokio::test)]
    async fn test_repeat_purchase_overwrites_and_reserves_twice() {
        let mut chain = MockChain::new();
        chain
            .expect_pull_approved_tokens()
            .times(2)
            .returning(|_, _| Ok(TxHash::repeat_byte(1)));
        chain
            .expect_reserve_locker()
            .with(eq(buyer_a()))
            .times(2)
            .returning(|_| Ok(TxHash::repeat_byte(2)));

        let (queue, worker) = worker(chain, MockMail::new());
        queue.enqueue(purchase(buyer_a(), 100, "first@x.com"));
        queue.enqueue(purchase(buyer_a(), 300, "second@x.com"));

        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 2, failed: 0 }
        );
        let record = worker.buyer(&buyer_a()).await.unwrap();
        assert_eq!(record.email, "second@x.com");
        assert_eq!(record.purchased_amount, U256::from(300));
    }

    #[test(tokio::test)]
    async fn test_full_lockers_leave_payment_orphaned() {
        let mut chain = MockChain::new();
        chain
            .expect_pull_approved_tokens()
            .times(1)
            .returning(|_, _| Ok(TxHash::repeat_byte(1)));
        chain
            .expect_reserve_locker()
            .times(1)
            .returning(|_| Err(RelayError::chain("reserveLocker", "execution reverted: No available lockers")));

        let (queue, worker) = worker(chain, MockMail::new());
        queue.enqueue(purchase(buyer_a(), 500, "a@x.com"));

        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 1, failed: 1 }
        );
        // no rollback of the registry entry
        assert!(worker.buyer(&buyer_a()).await.is_some());
    }

    #[test(tokio::test)]
    async fn test_failed_pull_skips_reservation() {
        let mut chain = MockChain::new();
        chain
            .expect_pull_approved_tokens()
            .returning(|_, _| Err(RelayError::chain("getApprovedAmount", "insufficient allowance")));
        chain.expect_reserve_locker().times(0);

        let (queue, worker) = worker(chain, MockMail::new());
        queue.enqueue(purchase(buyer_a(), 500, "a@x.com"));
        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 1, failed: 1 }
        );
    }

    #[test(tokio::test)]
    async fn test_lifecycle_emails_go_to_recorded_address() {
        let mut chain = MockChain::new();
        chain
            .expect_pull_approved_tokens()
            .returning(|_, _| Ok(TxHash::repeat_byte(1)));
        chain
            .expect_reserve_locker()
            .returning(|_| Ok(TxHash::repeat_byte(2)));

        let mut mail = MockMail::new();
        let mut seq = Sequence::new();
        mail.expect_send()
            .withf(|to, template| to == "a@x.com" && *template == EmailTemplate::LockerReserved { locker_number: 7 })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        mail.expect_send()
            .withf(|to, template| to == "a@x.com" && *template == EmailTemplate::LockerPickedUp { locker_number: 7 })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let (queue, worker) = worker(chain, mail);
        queue.enqueue(purchase(buyer_a(), 500, "a@x.com"));
        queue.enqueue(assigned(buyer_a(), 7));
        queue.enqueue(opened(buyer_a(), 7));

        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 3, failed: 0 }
        );
    }

    #[test(tokio::test)]
    async fn test_mail_failure_does_not_stop_the_pass() {
        let mut chain = MockChain::new();
        chain
            .expect_pull_approved_tokens()
            .returning(|_, _| Ok(TxHash::repeat_byte(1)));
        chain
            .expect_reserve_locker()
            .returning(|_| Ok(TxHash::repeat_byte(2)));

        let mut mail = MockMail::new();
        mail.expect_send()
            .times(2)
            .returning(|_, _| Err(RelayError::MailSendFailed("relay refused".to_string())));

        let (queue, worker) = worker(chain, mail);
        queue.enqueue(purchase(buyer_a(), 1, "a@x.com"));
        queue.enqueue(assigned(buyer_a(), 1));
        queue.enqueue(opened(buyer_a(), 1));

        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 3, failed: 2 }
        );
    }

    #[test(tokio::test)]
    async fn test_empty_drain_is_a_no_op() {
        let (_queue, worker) = worker(MockChain::new(), MockMail::new());
        assert_eq!(
            worker.drain().await,
            DrainOutcome::Drained { processed: 0, failed: 0 }
        );
    }

    /// Chain whose token pull blocks until released, to hold a drain pass open
    struct GatedChain {
        entered: Notify,
        release: Notify,
        pulls: std::sync::Mutex<Vec<Address>>,
    }

    #[async_trait]
    impl VendorChain for GatedChain {
        async fn pull_approved_tokens(&self, buyer: Address, _amount: U256) -> RelayResult<TxHash> {
            self.pulls.lock().unwrap().push(buyer);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(TxHash::zero())
        }
        async fn reserve_locker(&self, _buyer: Address) -> RelayResult<TxHash> {
            Ok(TxHash::zero())
        }
        async fn locker_assignee(&self, _locker: LockerNumber) -> RelayResult<Address> {
            Ok(Address::zero())
        }
        async fn open_locker(&self, _locker: LockerNumber, _signature: &LockerSignature) -> RelayResult<TxHash> {
            Ok(TxHash::zero())
        }
        async fn submit_permit(&self, _permit: &PermitRequest) -> RelayResult<TxHash> {
            Ok(TxHash::zero())
        }
        async fn transaction_status(&self, _tx_hash: TxHash) -> RelayResult<TxStatus> {
            Ok(TxStatus::Pending)
        }
    }

    #[test(tokio::test)]
    async fn test_concurrent_drain_is_rejected_and_order_kept() {
        let chain = Arc::new(GatedChain {
            entered: Notify::new(),
            release: Notify::new(),
            pulls: std::sync::Mutex::new(Vec::new()),
        });
        let (queue, receiver) = EventQueue::new();
        let worker = Arc::new(RelayWorker::new(
            receiver,
            queue.notifier(),
            chain.clone(),
            Arc::new(MockMail::new()),
        ));

        let first = Address::repeat_byte(0x01);
        let second = Address::repeat_byte(0x02);
        queue.enqueue(purchase(first, 1, "one@x.com"));

        let background = worker.clone();
        let pass = tokio::spawn(async move { background.drain().await });

        chain.entered.notified().await;
        // enqueued mid-pass, picked up by the same pass
        queue.enqueue(purchase(second, 2, "two@x.com"));
        assert_eq!(worker.drain().await, DrainOutcome::AlreadyDraining);

        chain.release.notify_one();
        chain.entered.notified().await;
        chain.release.notify_one();

        assert_eq!(
            pass.await.unwrap(),
            DrainOutcome::Drained { processed: 2, failed: 0 }
        );
        assert_eq!(*chain.pulls.lock().unwrap(), vec![first, second]);
    }

    #[test(tokio::test)]
    async fn test_run_drains_remaining_events_on_shutdown() {
        let mut chain = MockChain::new();
        chain
            .expect_pull_approved_tokens()
            .returning(|_, _| Ok(TxHash::repeat_byte(1)));
        chain
            .expect_reserve_locker()
            .returning(|_| Ok(TxHash::repeat_byte(2)));

        let (queue, worker) = worker(chain, MockMail::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(worker.clone().run(shutdown_rx));

        queue.enqueue(purchase(buyer_a(), 9, "a@x.com"));
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(queue.depth(), 0);
        assert_eq!(worker.buyer(&buyer_a()).await.unwrap().purchased_amount, U256::from(9));
    }
}
