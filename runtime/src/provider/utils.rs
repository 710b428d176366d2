use std::borrow::Cow;

use vmquery_ast::label::LabelFilter;

/// Combines the selector filters with the enforced filter groups. Every enforced group is
/// AND-ed with the selector filters; the groups themselves are OR-ed.
pub(crate) fn join_tag_filterss<'a>(
    src: &'a [LabelFilter],
    etfs: &'a [Vec<LabelFilter>],
) -> Cow<'a, [Vec<LabelFilter>]> {
    if etfs.is_empty() {
        return Cow::Owned(vec![src.to_vec()]);
    }
    if src.is_empty() {
        return Cow::Borrowed(etfs);
    }
    let dst = etfs
        .iter()
        .map(|etf| {
            let mut tfs = Vec::with_capacity(src.len() + etf.len());
            tfs.extend_from_slice(src);
            tfs.extend_from_slice(etf);
            tfs
        })
        .collect::<Vec<_>>();
    Cow::Owned(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_each_enforced_group() {
        let src = vec![LabelFilter::equal("__name__", "up")];
        let etfs = vec![
            vec![LabelFilter::equal("tenant", "a")],
            vec![LabelFilter::equal("tenant", "b")],
        ];
        let joined = join_tag_filterss(&src, &etfs);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined[0].len(), 2);
        assert_eq!(joined[1][1].value, "b");

        let joined = join_tag_filterss(&src, &[]);
        assert_eq!(joined.len(), 1);
    }
}
