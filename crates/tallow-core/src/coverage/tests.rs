//! Tests for coverage arithmetic against the observed allocation
//! behavior: a 40-socket host over single-socket pools needs 40 units,
//! a 50-socket host needs 50, and the instance granularity rounds
//! physical quantities up without multiplying coverage.

use super::*;
use crate::catalog::attr;
use crate::consumer::fact;

fn physical(sockets: u32) -> Consumer {
    Consumer::new("host1", "owner1")
        .with_fact(fact::IS_GUEST, "false")
        .with_fact(fact::SOCKETS, sockets.to_string())
}

fn guest() -> Consumer {
    Consumer::new("guest1", "owner1")
        .with_fact(fact::IS_GUEST, "true")
        .with_fact(fact::SOCKETS, "1")
}

fn stacked_pool_product() -> Product {
    Product::new("p-stacked", "stacked")
        .with_attribute(attr::SOCKETS, "1")
        .with_attribute(attr::INSTANCE_MULTIPLIER, "2")
        .with_attribute(attr::MULTI_ENTITLEMENT, "yes")
}

#[test]
fn host_requirement_counts_sockets_per_unit() {
    let calc = CoverageCalculator::new(1);
    assert_eq!(calc.required_quantity(&physical(40), &stacked_pool_product()), 40);
    assert_eq!(calc.required_quantity(&physical(50), &stacked_pool_product()), 50);
}

#[test]
fn granularity_rounds_physical_quantities_up() {
    let calc = CoverageCalculator::new(1);
    assert_eq!(calc.required_quantity(&physical(41), &stacked_pool_product()), 42);

    let wide = Product::new("wide", "wide")
        .with_attribute(attr::SOCKETS, "2")
        .with_attribute(attr::INSTANCE_MULTIPLIER, "4");
    // 41 sockets over 2-socket units = 21 units, rounded up to 24.
    assert_eq!(calc.required_quantity(&physical(41), &wide), 24);
}

#[test]
fn guests_are_exempt_from_granularity() {
    let calc = CoverageCalculator::new(1);
    assert_eq!(calc.required_quantity(&guest(), &stacked_pool_product()), 1);
}

#[test]
fn missing_socket_fact_uses_default() {
    let calc = CoverageCalculator::new(1);
    let c = Consumer::new("c1", "owner1");
    let two_socket = Product::new("p", "p").with_attribute(attr::SOCKETS, "2");
    assert_eq!(calc.required_quantity(&c, &two_socket), 1);
}

#[test]
fn non_socket_product_needs_one_unit() {
    let calc = CoverageCalculator::new(1);
    let plain = Product::new("plain", "plain");
    assert_eq!(calc.required_quantity(&physical(64), &plain), 1);
    assert!(matches!(calc.requirement(&physical(64), &plain), Requirement::Units(1)));
}

#[test]
fn requirement_accumulates_across_mixed_stack() {
    let calc = CoverageCalculator::new(1);
    let base = Product::new("base", "base").with_attribute(attr::SOCKETS, "2");
    let addon = stacked_pool_product();

    let mut remaining = calc.requirement(&physical(40), &base);
    remaining.apply(10, &base); // 10 units x 2 sockets
    assert_eq!(remaining, Requirement::Sockets(20));
    remaining.apply(20, &addon); // 20 units x 1 socket
    assert!(remaining.is_met());
}

#[test]
fn non_socket_pool_covers_socket_requirement_outright() {
    let mut remaining = Requirement::Sockets(40);
    remaining.apply(1, &Product::new("site", "site license"));
    assert!(remaining.is_met());
}

#[test]
fn quantity_toward_respects_availability_and_granularity() {
    let product = stacked_pool_product();
    // Wants 40, pool only has 20: take all 20 (a granularity multiple).
    let q = CoverageCalculator::quantity_toward(
        &physical(40),
        &product,
        Requirement::Sockets(40),
        Some(20),
    );
    assert_eq!(q, 20);

    // 19 available rounds down to 18 to stay on the granularity.
    let q = CoverageCalculator::quantity_toward(
        &physical(40),
        &product,
        Requirement::Sockets(40),
        Some(19),
    );
    assert_eq!(q, 18);

    // Final slice: 10 sockets left needs 10 units, available 20.
    let q = CoverageCalculator::quantity_toward(
        &physical(50),
        &product,
        Requirement::Sockets(10),
        Some(20),
    );
    assert_eq!(q, 10);
}

#[test]
fn quantity_toward_unlimited_pool_takes_full_want() {
    let product = stacked_pool_product();
    let q =
        CoverageCalculator::quantity_toward(&physical(40), &product, Requirement::Sockets(40), None);
    assert_eq!(q, 40);
}
