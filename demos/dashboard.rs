//! Loads a fake dashboard twice: once sequentially, once fanned out through a
//! session. Run with `cargo run --example dashboard --features logging`.
use std::collections::HashMap;
use std::thread;
use std::time::{Duration, Instant};

use matome::{CancelToken, RayonExecutor, Session, TaskResult};

#[derive(Debug, Clone)]
struct Order {
    id: u32,
    user: &'static str,
    total: u32,
}

fn users(token: &CancelToken) -> TaskResult<Vec<&'static str>> {
    token.sleep(Duration::from_millis(120))?;
    Ok(vec!["ana", "bo", "cy"])
}

fn orders(token: &CancelToken) -> TaskResult<Vec<Order>> {
    token.sleep(Duration::from_millis(200))?;
    Ok(vec![
        Order { id: 1, user: "ana", total: 30 },
        Order { id: 2, user: "bo", total: 12 },
        Order { id: 3, user: "ana", total: 7 },
    ])
}

fn settings(token: &CancelToken) -> TaskResult<HashMap<&'static str, &'static str>> {
    token.sleep(Duration::from_millis(80))?;
    Ok(HashMap::from([("currency", "EUR"), ("theme", "dark")]))
}

fn main() -> anyhow::Result<()> {
    matome::init_logging()?;

    let token = CancelToken::new();
    let started = Instant::now();
    let seq_users = users(&token)?;
    let seq_orders = orders(&token)?;
    let seq_settings = settings(&token)?;
    let sequential = started.elapsed();
    println!(
        "sequential: {} users, {} orders, {} settings in {sequential:.2?}",
        seq_users.len(),
        seq_orders.len(),
        seq_settings.len()
    );

    let mut session = Session::traced(RayonExecutor::with_threads(4)?);

    let users = session.label("users").query_list(users);
    let by_user = session
        .label("orders")
        .query_group(orders, |order: &Order| order.user);
    let by_id = session
        .label("orders by id")
        .query_map(orders, |order: &Order| order.id);
    let settings = session.label("settings").query_entries(settings);
    session.label("audit").execute(|_| {
        thread::sleep(Duration::from_millis(50));
        Ok(())
    });

    let started = Instant::now();
    let diagnostics = session.join_all(Duration::from_secs(2))?;
    println!("fan-out: joined in {:.2?}", started.elapsed());

    let spent: HashMap<_, u32> = by_user
        .unwrap_or_default()
        .into_iter()
        .map(|(user, orders)| (user, orders.iter().map(|o| o.total).sum()))
        .collect();

    println!("users: {:?}", users.unwrap_or_default());
    println!("spent: {spent:?}");
    println!("order ids: {}", by_id.get().map_or(0, HashMap::len));
    println!("settings: {:?}", settings.get());
    print!("{}", diagnostics.render_summary());

    Ok(())
}
