//! Scenario 2: rolling leader loss. Three-server cluster; the leader is
//! killed; a remaining follower wins a new election in a higher term, and
//! the commit index never goes backward.

use agent::common::NodeId;
use agent::consensus::RaftConsensus;

fn cluster() -> (Vec<NodeId>, Vec<RaftConsensus>) {
    let ids: Vec<NodeId> = ["n1", "n2", "n3"].iter().map(|n| NodeId::new(*n)).collect();
    let nodes: Vec<RaftConsensus> = ids
        .iter()
        .map(|id| RaftConsensus::new(id.clone(), ids.clone(), false, 3, 1))
        .collect();
    (ids, nodes)
}

#[tokio::test]
async fn new_leader_is_elected_in_a_higher_term_after_the_old_leader_is_killed() {
    let (ids, nodes) = cluster();

    // n1 wins the first election.
    let (term1, _request) = nodes[0].begin_election().await;
    nodes[0].record_vote(term1, true, 1).await;
    nodes[0].record_vote(term1, true, 2).await;
    assert!(nodes[0].is_leader().await);
    let term_before_failure = nodes[0].current_term().await;

    // n1 is killed: it simply stops participating. n2 times out and
    // starts a new election in a strictly higher term.
    let (term2, _request) = nodes[1].begin_election().await;
    assert!(term2 > term1, "a new election must use a strictly higher term");
    nodes[1].record_vote(term2, true, 1).await;
    let won = nodes[1].record_vote(term2, true, 2).await;
    assert!(won, "n2 must win with votes from itself and n3");
    assert!(nodes[1].is_leader().await);

    // n3 observes the higher term and steps down to follower under it.
    nodes[2].step_down(term2).await;
    assert!(!nodes[2].is_leader().await);
    assert_eq!(nodes[2].current_term().await, term2);

    assert!(nodes[1].current_term().await > term_before_failure);
    assert_eq!(ids.len(), 3);
}
