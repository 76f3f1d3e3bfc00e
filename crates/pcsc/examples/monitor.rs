//! Example printing reader lifecycle events and the UID of every card inserted

use std::collections::HashSet;
use std::time::Duration;

use nexum_pcsc::{Client, PcscDriver, ReaderState};

/// GET DATA (UID) pseudo-APDU understood by PC/SC contactless readers
const GET_UID: [u8; 5] = [0xff, 0xca, 0x00, 0x00, 0x00];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let client = Client::new(PcscDriver::establish()?);

    client.events().reader.on(|reader| {
        println!("Reader detected: {}", reader.name());
        let name = reader.name().to_string();
        reader.events().change.on(move |change| {
            println!(
                "{name}: {} atr={} protocol={:?}",
                change.status,
                hex::encode_upper(&change.atr),
                change.protocol
            );
        });
        let name = reader.name().to_string();
        reader.events().disconnect.on(move |_| println!("{name}: removed"));
        reader
            .events()
            .error
            .on(|err| println!("Reader error: {err}"));
    });
    client
        .events()
        .error
        .on(|err| println!("Driver error: {err}"));

    client.start()?;
    let pump = client.clone();
    let events = tokio::spawn(async move { pump.run().await });

    println!("Waiting for cards, press Ctrl-C to exit");
    let mut read = HashSet::new();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {}
        }

        for reader in client.readers() {
            if reader.state() != ReaderState::Connected {
                read.remove(reader.name());
                continue;
            }
            if !read.insert(reader.name().to_string()) {
                continue;
            }
            match reader
                .with_card(async |card| Ok(card.transmit(&GET_UID, None).await?.into_owned()))
                .await
            {
                Ok(response) => {
                    println!("{}: UID response {}", reader.name(), hex::encode_upper(response));
                }
                Err(err) => println!("{}: {err}", reader.name()),
            }
        }
    }

    client.stop().await;
    events.await?;
    Ok(())
}
