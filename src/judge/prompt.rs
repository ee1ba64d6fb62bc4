//! Deterministic prompt construction for the two judge call shapes.
//!
//! Inputs are concatenated in a fixed order; the cache key is a hash
//! over the exact bytes produced here, so any change to these templates
//! invalidates previously cached verdicts.

use crate::post::Post;

/// A candidate hydrated for ranking, carrying its dense recall score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub title: String,
    pub summary: String,
    pub body: String,
    pub dense: f32,
}

/// "One query, N candidate posts" — scores each post against the query.
pub fn build_rank_prompt(query: &Post, candidates: &[Candidate]) -> String {
    let mut prompt = format!(
        "You are a semantic search relevance evaluator. Given a search query and a list of posts, score each post's relevance to the query from 0-100.\n\n\
         Query:\n\
         Title: {}\n\
         Summary: {}\n\
         Detail: {}\n\n\
         IMPORTANT: Score based on DIRECT relevance to the query topic. Posts must contain actual content about the query subject, not just tangential associations or superficial word matches.\n\n\
         Posts to evaluate:\n",
        query.title, query.summary, query.body
    );

    for candidate in candidates {
        prompt.push_str(&format!(
            "\nPost ID {}:\nTitle: {}\nSummary: {}\nBody: {}\n---\n",
            candidate.id, candidate.title, candidate.summary, candidate.body
        ));
    }

    prompt.push_str(
        "\nFor each post, evaluate:\n\
         - Does the post DIRECTLY address the query topic?\n\
         - Is there concrete, specific content related to the query?\n\
         - Would someone searching for this query find this post genuinely useful?\n\n\
         Return ONLY a JSON array with this exact format:\n\
         [{\"id\": <post_id>, \"score\": <0-100>}, ...]\n\n\
         Score from 0-100 where:\n\
         - 0-39: Not relevant - no meaningful connection to query topic\n\
         - 40-59: Somewhat relevant - mentions related concepts but not the main topic\n\
         - 60-79: Relevant - directly addresses the query topic\n\
         - 80-100: Highly relevant - comprehensive, specific content about the query topic\n\n\
         Sort by score descending (highest first).\n",
    );

    prompt
}

/// "One post, N queries" — scores the new post against each query.
pub fn build_evaluate_prompt(queries: &[Post], post: &Post) -> String {
    let mut prompt = String::from(
        "You are a semantic search relevance evaluator. Below are search queries from users looking for specific content.\n\n",
    );

    for query in queries {
        prompt.push_str(&format!(
            "Query {}: {} {} {}\n\n",
            query.id, query.title, query.summary, query.body
        ));
    }

    prompt.push_str(&format!(
        "A new post has just been created:\n\
         Title: {}\n\
         Summary: {}\n\
         Body: {}\n\n\
         For EACH query above, score 0-100: Does this new post answer or match what that query is searching for? Would someone who created that query want to see this post in their results?\n\n\
         Evaluate each query:\n\
         - Does the post provide relevant information the query is looking for?\n\
         - Does it match the semantic intent and topic of the query?\n\
         - Would the query author find this post useful?\n\n\
         Return ONLY a JSON array with this exact format:\n\
         [{{\"query_id\": <id>, \"score\": <0-100>}}, ...]\n\n\
         Score from 0-100 where:\n\
         - 0-39: Not relevant (query author wouldn't want to see this)\n\
         - 40-59: Somewhat relevant\n\
         - 60-79: Relevant\n\
         - 80-100: Highly relevant (exactly what the query is looking for)\n\n\
         Include ALL queries in your response, even if score is 0.\n",
        post.title, post.summary, post.body
    ));

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::post::{PostParent, TEMPLATE_POST, TEMPLATE_QUERY};

    fn post(id: i64, title: &str, template: &str) -> Post {
        Post {
            id,
            user_id: 1,
            parent: PostParent::Root,
            title: title.into(),
            summary: "s".into(),
            body: "b".into(),
            template_name: template.into(),
            timezone: "UTC".into(),
            location_tag: None,
            ai_generated: false,
            image_url: None,
            clip_offset_x: None,
            clip_offset_y: None,
            rev: 0,
            has_new_matches: false,
            last_match_added_at: None,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_rank_prompt_is_deterministic() {
        let query = post(1, "q", TEMPLATE_QUERY);
        let candidates = vec![Candidate {
            id: 2,
            title: "t".into(),
            summary: "s".into(),
            body: "b".into(),
            dense: 0.5,
        }];
        assert_eq!(
            build_rank_prompt(&query, &candidates),
            build_rank_prompt(&query, &candidates)
        );
    }

    #[test]
    fn test_rank_prompt_names_every_candidate() {
        let query = post(1, "q", TEMPLATE_QUERY);
        let candidates: Vec<Candidate> = (10..13)
            .map(|id| Candidate {
                id,
                title: format!("title-{}", id),
                summary: "s".into(),
                body: "b".into(),
                dense: 0.5,
            })
            .collect();
        let prompt = build_rank_prompt(&query, &candidates);
        for id in 10..13 {
            assert!(prompt.contains(&format!("Post ID {}:", id)));
        }
        assert!(prompt.contains("0-39: Not relevant"));
    }

    #[test]
    fn test_evaluate_prompt_names_every_query() {
        let queries: Vec<Post> = (1..4).map(|id| post(id, "q", TEMPLATE_QUERY)).collect();
        let new_post = post(9, "fresh", TEMPLATE_POST);
        let prompt = build_evaluate_prompt(&queries, &new_post);
        for id in 1..4 {
            assert!(prompt.contains(&format!("Query {}:", id)));
        }
        assert!(prompt.contains("\"query_id\""));
        assert!(prompt.contains("Title: fresh"));
    }
}
