//! Hands an integer to a unit, chats with it once, and collects its doubled
//! input. Run with `RUST_LOG=debug` to see the unit lifecycle.

use strand::{Payload, Registry, Scope};

fn double(scope: &Scope) -> Option<Payload> {
    let input: i32 = scope.yield_(None).ok()??.take().ok()?;
    eprintln!("double: got input {input}");

    eprintln!("double: returning to main");
    let reply = scope
        .yield_(Some(Payload::new("I am calculating, please wait...")))
        .ok()??;
    eprintln!(
        "double: resumed from main with {:?}",
        reply.downcast_ref::<&str>()
    );

    Some(Payload::new(input * 2))
}

fn main() -> Result<(), strand::Error> {
    env_logger::init();

    let registry = Registry::new();
    let unit = registry.create(double)?;

    registry.resume(&unit, None)?;

    let input = 42;
    if let Some(reply) = registry.resume(&unit, Some(Payload::new(input)))? {
        eprintln!("main: got reply {:?}", reply.take::<&str>()?);
    }

    let result = registry.resume(
        &unit,
        Some(Payload::new("Please be quick, I am waiting for your result")),
    )?;
    if let Some(result) = result {
        eprintln!("main: twice {input} is {}", result.take::<i32>()?);
    }

    match registry.resume(&unit, None) {
        Err(err) => log::info!("main: {err}"),
        Ok(_) => unreachable!("a finished unit cannot be resumed"),
    }
    eprintln!("bye");
    Ok(())
}
