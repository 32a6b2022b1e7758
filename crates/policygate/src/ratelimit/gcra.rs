//! The Generic Cell Rate Algorithm, over integer nanoseconds.

/// A GCRA decision for one `(key, count)` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
	pub allowed: bool,
	pub remaining: i64,
	pub reset_ns: i64,
	pub retry_after_ns: i64,
	pub full_quota_ns: i64,
}

/// Static parameters for one rate-limited key: the steady emission
/// interval, the extra burst allowance expressed as nanoseconds pulled
/// forward, the cell count a full burst holds, and the store TTL.
#[derive(Debug, Clone, Copy)]
pub struct Params {
	pub emission_interval_ns: i64,
	pub burst_allowance_ns: i64,
	pub burst_capacity: i64,
	pub ttl_s: u64,
}

impl Params {
	/// Builds the steady-state parameters for `rate` requests per `period`
	/// plus `burst` additional capacity.
	pub fn new(rate: u64, period_ns: i64, burst: u64) -> Self {
		let rate = rate.max(1) as i64;
		let emission_interval_ns = period_ns / rate;
		Self {
			emission_interval_ns,
			burst_allowance_ns: emission_interval_ns * burst as i64,
			burst_capacity: rate + burst as i64,
			ttl_s: (period_ns / 1_000_000_000).max(1) as u64 * 2,
		}
	}
}

fn ceil_div(numerator: i64, denominator: i64) -> i64 {
	if denominator <= 0 {
		return 0;
	}
	(numerator + denominator - 1) / denominator
}

/// Runs one GCRA step against a previously-read `tat_ns` (the store's
/// theoretical-arrival-time for this key, or `now_ns` on a cache miss).
/// `count == 0` is a non-mutating peek: the caller must not write the
/// returned `reset_ns` back to the store in that case.
pub fn step(tat_ns: i64, now_ns: i64, count: i64, params: Params) -> Decision {
	let tat_ns = tat_ns.max(now_ns);
	let allow_at_ns = tat_ns - params.burst_allowance_ns;
	let remaining_before =
		(params.burst_capacity - ceil_div((tat_ns - now_ns).max(0), params.emission_interval_ns)).max(0);

	if now_ns >= allow_at_ns && count <= remaining_before {
		let new_tat = tat_ns + params.emission_interval_ns * count;
		let remaining_after =
			(params.burst_capacity - ceil_div((new_tat - now_ns).max(0), params.emission_interval_ns)).max(0);
		Decision {
			allowed: true,
			remaining: remaining_after,
			reset_ns: new_tat,
			retry_after_ns: 0,
			full_quota_ns: new_tat.max(now_ns),
		}
	} else {
		Decision {
			allowed: false,
			remaining: remaining_before,
			reset_ns: tat_ns,
			retry_after_ns: (allow_at_ns - now_ns).max(0),
			full_quota_ns: tat_ns,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn params(rate: u64, burst: u64) -> Params {
		// 1 request/second steady rate, for arithmetic that's easy to check by hand.
		Params::new(rate, 1_000_000_000, burst)
	}

	#[test]
	fn first_request_on_an_empty_key_is_accepted() {
		let p = params(1, 0);
		let d = step(0, 0, 1, p);
		assert!(d.allowed);
		assert_eq!(d.reset_ns, p.emission_interval_ns);
	}

	#[test]
	fn burst_capacity_is_exhausted_then_denies() {
		let p = params(1, 2); // capacity 3
		let mut tat = 0i64;
		let now = 0i64;
		for _ in 0..3 {
			let d = step(tat, now, 1, p);
			assert!(d.allowed);
			tat = d.reset_ns;
		}
		let d = step(tat, now, 1, p);
		assert!(!d.allowed);
		assert!(d.retry_after_ns > 0);
	}

	#[test]
	fn tat_decays_back_to_headroom_over_time() {
		let p = params(1, 0);
		let d1 = step(0, 0, 1, p);
		assert!(d1.allowed);
		// Enough elapsed time for the single emission interval to fully decay.
		let d2 = step(d1.reset_ns, d1.reset_ns, 1, p);
		assert!(d2.allowed);
	}

	#[test]
	fn zero_count_peek_does_not_change_the_decision_inputs() {
		let p = params(1, 0);
		let d1 = step(0, 0, 0, p);
		assert!(d1.allowed);
		assert_eq!(d1.reset_ns, 0, "a peek must not advance tat");
		let d2 = step(0, 0, 1, p);
		assert!(d2.allowed);
	}

	#[test]
	fn deny_does_not_mutate_reset_ns_beyond_current_tat() {
		let p = params(1, 0);
		let d1 = step(0, 0, 1, p);
		let d2 = step(d1.reset_ns, 0, 1, p);
		assert!(!d2.allowed);
		assert_eq!(d2.reset_ns, d1.reset_ns);
	}
}
