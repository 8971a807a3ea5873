use num_bigint::BigUint;
use proptest::prelude::*;
use qf_round::claim::tally_results_batch;
use qf_round::{
    compute_allocations, compute_tally, upload_ranges, FinalizeRequest, FundingRound,
    KeccakFieldCommitment, Message, MessageLog, PubKey, ReplayMode, Replayer, RoundError,
    RoundPhase, SaltSource, TallyData, TallyParams, ALPHA_PRECISION,
};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const MACI: &str = "0x00000000000000000000000000000000000000aa";

fn big(v: u64) -> BigUint {
    BigUint::from(v)
}

fn key(name: &str) -> PubKey {
    PubKey::new(name)
}

fn temp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    std::env::temp_dir().join(format!("qf_round_{prefix}_{nanos}"))
}

fn tally(log: &MessageLog, recipients: usize, mode: ReplayMode) -> TallyData {
    let mut params = TallyParams::new(MACI, big(1), recipients);
    params.replay_mode = mode;
    compute_tally(log, &params, &SaltSource::from_seed([7; 32]), &KeccakFieldCommitment)
        .unwrap()
        .data
}

fn column(values: &[BigUint]) -> Vec<u64> {
    values
        .iter()
        .map(|v| u64::try_from(v).unwrap())
        .collect()
}

/// Contributor A splits 45/45, retracts recipient 1, then puts all 90 on
/// recipient 2; contributor B puts 40 on recipient 2.
fn end_to_end_log() -> MessageLog {
    let mut log = MessageLog::default();
    log.sign_up(1, key("a"), 90);
    log.sign_up(2, key("b"), 40);
    log.submit_batch(vec![
        Message::vote(1, 1, 1, 45).signed_by(key("a")),
        Message::vote(1, 2, 2, 45).signed_by(key("a")),
        Message::vote(1, 3, 1, 0).signed_by(key("a")),
        Message::vote(1, 4, 2, 90).signed_by(key("a")),
    ]);
    log.submit_batch(vec![Message::vote(2, 1, 2, 40).signed_by(key("b"))]);
    log
}

fn bribe_log() -> MessageLog {
    let mut log = MessageLog::default();
    log.sign_up(1, key("a"), 90);
    log.sign_up(2, key("c"), 40);
    log.submit_batch(vec![
        Message::vote(1, 1, 1, 90).signed_by(key("a")),
        Message::key_change(1, 2, key("junk")).signed_by(key("a")),
    ]);
    log.submit_batch(vec![
        Message::key_change(1, 1, key("b")).signed_by(key("a")),
        Message::vote(1, 2, 1, 0).signed_by(key("b")),
        Message::vote(1, 3, 2, 90).signed_by(key("b")),
    ]);
    log.submit_batch(vec![Message::vote(2, 1, 2, 40).signed_by(key("c"))]);
    log
}

#[test]
fn later_vote_overrides_earlier_one() {
    let mut log = MessageLog::default();
    log.sign_up(1, key("a"), 10);
    log.submit_batch(vec![
        Message::vote(1, 1, 1, 6),
        Message::vote(1, 2, 2, 2),
        Message::vote(1, 3, 1, 2),
    ]);
    let data = tally(&log, 3, ReplayMode::Sequential);
    assert_eq!(column(&data.per_vo_spent_voice_credits.tally), vec![0, 2, 2]);
    assert_eq!(column(&data.results.tally), vec![0, 1, 1]);
    assert_eq!(data.total_spent_voice_credits.spent, big(4));
}

#[test]
fn zero_vote_retracts() {
    let mut log = MessageLog::default();
    log.sign_up(1, key("a"), 50);
    log.submit_batch(vec![Message::vote(1, 1, 1, 50), Message::vote(1, 2, 1, 0)]);
    let data = tally(&log, 2, ReplayMode::Sequential);
    assert_eq!(column(&data.results.tally), vec![0, 0]);
    assert_eq!(column(&data.per_vo_spent_voice_credits.tally), vec![0, 0]);
    assert_eq!(data.total_spent_voice_credits.spent, big(0));
}

#[test]
fn quadratic_votes_sum_roots() {
    let mut log = MessageLog::default();
    log.sign_up(1, key("a"), 25);
    log.sign_up(2, key("b"), 25);
    log.sign_up(3, key("c"), 100);
    log.submit_batch(vec![Message::vote(1, 1, 1, 25)]);
    log.submit_batch(vec![Message::vote(2, 1, 1, 25)]);
    log.submit_batch(vec![Message::vote(3, 1, 2, 100)]);
    let data = tally(&log, 3, ReplayMode::Sequential);
    // 5 + 5, not sqrt(50); one contributor of 100 reaches the same root sum
    assert_eq!(column(&data.results.tally), vec![0, 10, 10]);
    assert_eq!(column(&data.per_vo_spent_voice_credits.tally), vec![0, 50, 100]);

    let factor = big(3);
    let quadratic = compute_allocations(&data, &big(ALPHA_PRECISION), &factor).unwrap();
    assert_eq!(quadratic[1].amount, big(300));
    assert_eq!(quadratic[2].amount, big(300));
    let linear = compute_allocations(&data, &big(0), &factor).unwrap();
    assert_eq!(linear[1].amount, big(150));
    assert_eq!(linear[2].amount, big(300));
    let half = compute_allocations(&data, &big(ALPHA_PRECISION / 2), &factor).unwrap();
    assert_eq!(half[1].amount, big(225));
    assert_eq!(half[2].amount, big(300));
}

#[test]
fn end_to_end_tally_in_both_modes() {
    for mode in [ReplayMode::Sequential, ReplayMode::Verified] {
        let data = tally(&end_to_end_log(), 3, mode);
        assert_eq!(column(&data.per_vo_spent_voice_credits.tally), vec![0, 0, 130], "{mode}");
        assert_eq!(data.total_spent_voice_credits.spent, big(130), "{mode}");
        // isqrt(90) + isqrt(40)
        assert_eq!(column(&data.results.tally), vec![0, 0, 15], "{mode}");
    }
}

#[test]
fn bribed_vote_is_invalidated() {
    for mode in [ReplayMode::Sequential, ReplayMode::Verified] {
        let (votes, _) = Replayer::new(3, mode).replay(&bribe_log()).unwrap();
        let target = votes.user(1).unwrap();
        assert_eq!(target.credits_for(1), big(0), "{mode}");
        assert_eq!(target.credits_for(2), big(90), "{mode}");
        let data = tally(&bribe_log(), 3, mode);
        assert_eq!(column(&data.per_vo_spent_voice_credits.tally), vec![0, 0, 130], "{mode}");
    }
}

#[test]
fn recomputation_is_byte_identical() {
    let log = end_to_end_log();
    let reparsed = MessageLog::from_json_str(&log.to_json_string().unwrap()).unwrap();
    let first = tally(&log, 3, ReplayMode::Sequential);
    let second = tally(&reparsed, 3, ReplayMode::Sequential);
    assert_eq!(first, second);
    assert_eq!(first.checksum().unwrap(), second.checksum().unwrap());
}

#[test]
fn out_of_range_vote_is_excluded_and_reported() {
    let mut log = MessageLog::default();
    log.sign_up(1, key("a"), 20);
    log.submit_batch(vec![Message::vote(1, 1, 1, 9), Message::vote(1, 2, 7, 9)]);
    let params = TallyParams::new(MACI, big(1), 3);
    let outcome =
        compute_tally(&log, &params, &SaltSource::from_seed([7; 32]), &KeccakFieldCommitment)
            .unwrap();
    assert_eq!(outcome.report.excluded.len(), 1);
    assert_eq!(outcome.data.total_spent_voice_credits.spent, big(9));
}

#[test]
fn full_round_with_resumed_upload() {
    let scheme = KeccakFieldCommitment;
    let data = tally(&end_to_end_log(), 3, ReplayMode::Sequential);
    let committed = data.verified_commitments(&scheme).unwrap();

    let dir = temp_dir("lifecycle");
    let state = dir.join("round.json");
    let mut round = FundingRound::new(big(19), big(1), 3, 1).unwrap();
    round.contribute("0xa", big(90)).unwrap();
    round.contribute("0xb", big(40)).unwrap();
    round.close_voting(true).unwrap();
    round.submit_tally(&committed, &data, &scheme).unwrap();
    assert_eq!(round.phase(), RoundPhase::Tallying);

    let ranges = upload_ranges(round.recipient_count(), round.uploaded_count(), 2).unwrap();
    assert_eq!(ranges.len(), 2);
    let first = &ranges[0];
    let batch = tally_results_batch(&data, first.start, first.end - first.start, &scheme).unwrap();
    round.upload_tally_batch(first.start, &batch, &scheme).unwrap();
    round.save(&state).unwrap();

    // a restarted driver picks up where the saved state left off
    let mut round = FundingRound::load(&state).unwrap();
    round.verify_tally_checksum(&data).unwrap();
    let remaining = upload_ranges(round.recipient_count(), round.uploaded_count(), 2).unwrap();
    assert_eq!(remaining.len(), 1);
    for range in remaining {
        let batch =
            tally_results_batch(&data, range.start, range.end - range.start, &scheme).unwrap();
        round.upload_tally_batch(range.start, &batch, &scheme).unwrap();
    }

    let alpha = round
        .finalize(
            FinalizeRequest {
                total_spent: data.total_spent_voice_credits.spent.clone(),
                total_spent_salt: data.total_spent_voice_credits.salt.clone(),
                alpha: None,
            },
            &scheme,
        )
        .unwrap();
    // pool 19 over (225 - 130) excess quadratic weight
    assert_eq!(alpha, big(ALPHA_PRECISION / 5));
    assert_eq!(round.claim(2).unwrap(), big(149));
    assert_eq!(round.claim(1).unwrap(), big(0));
    assert_eq!(round.claim(2), Err(RoundError::AlreadyClaimed(2)));
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn cancelled_round_refunds_contributors() {
    let mut round = FundingRound::new(big(100), big(1), 3, 1).unwrap();
    round.contribute("0xa", big(90)).unwrap();
    round.close_voting(true).unwrap();
    round.cancel().unwrap();
    assert_eq!(round.withdraw("0xa").unwrap(), big(90));
    assert_eq!(
        round.withdraw("0xa"),
        Err(RoundError::AlreadyWithdrawn("0xa".into()))
    );
    assert!(round.claim(1).is_err());
}

proptest! {
    #[test]
    fn linear_spend_sums_to_total(
        votes in prop::collection::vec(
            prop::collection::vec((0usize..4, 0u64..50), 1..6),
            1..5,
        )
    ) {
        let mut log = MessageLog::default();
        for (user, sequence) in votes.iter().enumerate() {
            let state_index = user as u64 + 1;
            log.sign_up(state_index, key("k"), 1_000);
            log.submit_batch(
                sequence
                    .iter()
                    .enumerate()
                    .map(|(i, (recipient, credits))| {
                        Message::vote(state_index, i as u64 + 1, *recipient, *credits)
                    })
                    .collect(),
            );
        }
        let data = tally(&log, 4, ReplayMode::Sequential);
        let linear: BigUint = data.per_vo_spent_voice_credits.tally.iter().sum();
        prop_assert_eq!(linear, data.total_spent_voice_credits.spent.clone());
        prop_assert_eq!(data.clone(), tally(&log, 4, ReplayMode::Sequential));
    }
}
