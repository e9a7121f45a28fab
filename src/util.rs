/// Current unix time in whole seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Human "x ago" rendering for chat replies.
pub fn readable_ago(timestamp: i64) -> String {
    let diff = (now_ts() - timestamp).max(0);
    let plural = |n: i64| if n == 1 { "" } else { "s" };

    if diff < 60 {
        format!("{diff} second{} ago", plural(diff))
    } else if diff < 3600 {
        let minutes = diff / 60;
        format!("{minutes} minute{} ago", plural(minutes))
    } else if diff < 86_400 {
        let hours = diff / 3600;
        let minutes = (diff % 3600) / 60;
        format!(
            "{hours} hour{} and {minutes} minute{} ago",
            plural(hours),
            plural(minutes)
        )
    } else if diff < 2_592_000 {
        let days = diff / 86_400;
        let hours = (diff % 86_400) / 3600;
        format!(
            "{days} day{} and {hours} hour{} ago",
            plural(days),
            plural(hours)
        )
    } else {
        let days = diff / 86_400;
        format!("{days} day{} ago", plural(days))
    }
}
