//! Embedded coedit Example
//!
//! Drives the service directly, without a network transport: two simulated
//! editors join the same document, type, and converge.
//!
//! Run with: cargo run -p coedit-transport --example embedded

use std::sync::Arc;
use std::time::Duration;

use coedit_core::{ConnectionId, DocumentId};
use coedit_protocol::{encode_sync, Channel, SyncMessage, UserInfo};
use coedit_storage::{MemoryStorage, Storage};
use coedit_transport::{CollabService, ConnectionReceiver, Metrics, ServiceConfig};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, Text, Transact, Update};

fn type_text(editor: &Doc, index: u32, chunk: &str) -> Vec<u8> {
    let text = editor.get_or_insert_text("content");
    let before = editor.transact().state_vector();
    {
        let mut txn = editor.transact_mut();
        text.insert(&mut txn, index, chunk);
    }
    editor.transact().encode_state_as_update_v1(&before)
}

fn absorb(editor: &Doc, rx: &mut ConnectionReceiver) -> Result<(), Box<dyn std::error::Error>> {
    for message in rx.drain() {
        if let Some(SyncMessage::SyncStep2(update)) | Some(SyncMessage::Update(update)) =
            message.as_sync()
        {
            let mut txn = editor.transact_mut();
            txn.apply_update(Update::decode_v1(&update)?);
        }
    }
    Ok(())
}

fn content(editor: &Doc) -> String {
    let text = editor.get_or_insert_text("content");
    let txn = editor.transact();
    text.get_string(&txn)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let storage = Arc::new(MemoryStorage::new());
    let config = ServiceConfig::default().with_save_debounce(Duration::from_millis(200));
    let service = CollabService::new(storage.clone(), config, Arc::new(Metrics::new()?));

    let doc = DocumentId::new("doc-7")?;
    let (alice, bob) = (ConnectionId::new("alice")?, ConnectionId::new("bob")?);
    let mut alice_rx = service.on_connect(alice.clone())?;
    let mut bob_rx = service.on_connect(bob.clone())?;
    let (alice_doc, bob_doc) = (Doc::new(), Doc::new());

    service.join_document(&alice, &doc, UserInfo::named("Alice")).await?;
    service.join_document(&bob, &doc, UserInfo::named("Bob")).await?;
    absorb(&alice_doc, &mut alice_rx)?;
    absorb(&bob_doc, &mut bob_rx)?;

    let update = type_text(&alice_doc, 0, "Hello");
    service.on_message(&alice, Channel::Sync, &encode_sync(&SyncMessage::Update(update)));
    absorb(&bob_doc, &mut bob_rx)?;

    let update = type_text(&bob_doc, 5, " world");
    service.on_message(&bob, Channel::Sync, &encode_sync(&SyncMessage::Update(update)));
    absorb(&alice_doc, &mut alice_rx)?;

    println!("Alice sees: {:?}", content(&alice_doc));
    println!("Bob sees:   {:?}", content(&bob_doc));

    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("Stats: {:?}", service.stats());

    service.on_disconnect(&alice).await;
    service.on_disconnect(&bob).await;

    let stored = storage.stats().await?;
    println!(
        "Stored {} document(s), {} bytes",
        stored.document_count, stored.total_size_bytes
    );

    Ok(())
}
