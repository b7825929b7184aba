use super::{reaction, Harness, MockSender};
use chat_outbox::MessageBody;

fn sent_reactions(h: &Harness) -> Vec<String> {
    h.sender
        .sent()
        .into_iter()
        .filter_map(|s| match s.body {
            MessageBody::Reaction(r) => Some(r.body),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn toggling_twice_sends_nothing() {
    let h = Harness::new(MockSender::ok());
    h.queue(reaction("c1", ":+1:"));
    h.queue(reaction("c1", ":+1:"));

    h.pass().await;

    assert_eq!(h.sender.calls(), 0);
    assert!(h.pending().is_empty());
}

#[tokio::test]
async fn toggling_three_times_sends_once() {
    let h = Harness::new(MockSender::ok());
    for _ in 0..3 {
        h.queue(reaction("c1", ":+1:"));
    }

    h.pass().await;

    assert_eq!(sent_reactions(&h), vec![":+1:"]);
    assert!(h.pending().is_empty());
}

#[tokio::test]
async fn different_emoji_are_independent() {
    let h = Harness::new(MockSender::ok());
    h.queue(reaction("c1", ":+1:"));
    h.queue(reaction("c1", ":tada:"));

    h.pass().await;

    assert_eq!(sent_reactions(&h), vec![":+1:", ":tada:"]);
}

#[tokio::test]
async fn same_reaction_in_another_conversation_is_kept() {
    let h = Harness::new(MockSender::ok());
    h.queue(reaction("c1", ":+1:"));
    h.queue(reaction("c2", ":+1:"));

    h.pass().await;

    assert_eq!(h.sender.sent().len(), 2);
}
