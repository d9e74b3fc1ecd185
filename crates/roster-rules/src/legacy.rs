//! Fixed-format parsers for the two legacy league page kinds: division ranking tables and
//! team roster pages.

use std::collections::HashSet;

use roster_core::{Division, MatchRecord, MatchStatus, Player, RankingRow, Team};
use scraper::{ElementRef, Html, Selector};
use serde::Serialize;

use crate::{element_text, text_or_none, ExtractionIssue};

const RANKING: &str = "ranking_table";
const ROSTER: &str = "team_roster";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankingPage {
    pub division: Division,
    pub teams: Vec<Team>,
    pub standings: Vec<RankingRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RosterPage {
    pub players: Vec<Player>,
    pub matches: Vec<MatchRecord>,
}

fn selector(resource: &str, css: &str) -> Result<Selector, ExtractionIssue> {
    Selector::parse(css).map_err(|e| ExtractionIssue::StructuralParsing {
        resource: resource.to_string(),
        message: format!("selector {css:?}: {e}"),
    })
}

fn last_number(text: &str) -> Option<i64> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .last()
        .and_then(|run| run.parse().ok())
}

fn ancestor<'a>(element: ElementRef<'a>, name: &str) -> Option<ElementRef<'a>> {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|e| e.value().name() == name)
}

/// Teams listed under the "Mannschaften" navigation entry.
fn navigation_teams(document: &Html) -> Result<Vec<Team>, ExtractionIssue> {
    let anchors = selector(RANKING, "a")?;
    let nested_list = selector(RANKING, "ul")?;
    let entries = selector(RANKING, "li")?;
    let link = selector(RANKING, "a[href]")?;
    let label = selector(RANKING, "span")?;

    let mut seen = HashSet::new();
    let mut teams = Vec::new();
    for nav in document
        .select(&anchors)
        .filter(|a| element_text(*a).eq_ignore_ascii_case("mannschaften"))
    {
        let Some(list) = ancestor(nav, "li").and_then(|li| li.select(&nested_list).next()) else {
            continue;
        };
        for entry in list.select(&entries) {
            let (Some(a), Some(span)) = (entry.select(&link).next(), entry.select(&label).next()) else {
                continue;
            };
            let (Some(name), Some(href)) = (
                text_or_none(element_text(span)),
                a.value().attr("href").and_then(|h| text_or_none(h.to_string())),
            ) else {
                continue;
            };
            if seen.insert(name.clone()) {
                let mut team = Team::from_display_name(&name);
                team.roster_link = Some(href);
                teams.push(team);
            }
        }
    }
    Ok(teams)
}

fn standings(document: &Html) -> Result<Vec<RankingRow>, ExtractionIssue> {
    let marked = selector(RANKING, "table.ranking, table.tabelle, table.standings")?;
    let any_table = selector(RANKING, "table")?;
    let rows = selector(RANKING, "tr")?;
    let cells = selector(RANKING, "td")?;

    let Some(table) = document
        .select(&marked)
        .next()
        .or_else(|| document.select(&any_table).next())
    else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for tr in table.select(&rows) {
        let texts: Vec<String> = tr.select(&cells).map(element_text).collect();
        if texts.len() < 2 {
            continue;
        }
        let Ok(position) = texts[0].trim_end_matches('.').parse::<i64>() else {
            continue;
        };
        let Some(team_name) = text_or_none(texts[1].clone()) else {
            continue;
        };
        let points = if texts.len() > 2 {
            texts.last().and_then(|t| points_of(t))
        } else {
            None
        };
        out.push(RankingRow {
            position,
            team_name,
            points,
        });
    }
    Ok(out)
}

/// Parses a division ranking page; `division` is the name taken from the file name.
pub fn parse_ranking_page(html: &str, division: &str) -> Result<RankingPage, ExtractionIssue> {
    let document = Html::parse_document(html);
    let standings = standings(&document)?;
    let mut teams = navigation_teams(&document)?;
    if teams.is_empty() {
        teams = standings
            .iter()
            .map(|row| Team::from_display_name(&row.team_name))
            .collect();
    }
    if teams.is_empty() {
        return Err(ExtractionIssue::StructuralParsing {
            resource: RANKING.to_string(),
            message: format!("no team navigation or standings found for {division}"),
        });
    }
    Ok(RankingPage {
        division: Division::new(division),
        teams,
        standings,
    })
}

fn players(document: &Html) -> Result<Vec<Player>, ExtractionIssue> {
    let player_links = selector(ROSTER, r#"a[href*="Spieler"]"#)?;
    let live_pz_cell = selector(ROSTER, r#"td.tooltip[title*="LivePZ-Wert"]"#)?;

    let mut players = Vec::new();
    for a in document.select(&player_links) {
        let Some(tr) = ancestor(a, "tr") else {
            continue;
        };
        let Some(full_name) = text_or_none(element_text(a)) else {
            continue;
        };
        let live_pz = tr.select(&live_pz_cell).next().and_then(|td| last_number(&element_text(td)));
        players.push(Player { full_name, live_pz });
    }

    // Pages without row structure: pair names and LivePZ cells by position.
    if players.is_empty() {
        let values: Vec<Option<i64>> = document
            .select(&live_pz_cell)
            .map(|td| last_number(&element_text(td)))
            .collect();
        players = document
            .select(&player_links)
            .filter_map(|a| text_or_none(element_text(a)))
            .enumerate()
            .map(|(index, full_name)| Player {
                full_name,
                live_pz: values.get(index).copied().flatten(),
            })
            .collect();
    }

    let mut seen = HashSet::new();
    players.retain(|p| seen.insert(p.full_name.clone()));
    Ok(players)
}

fn parse_score(text: &str) -> Option<(i64, i64)> {
    let (home, guest) = text.split_once(':')?;
    let home: String = home.chars().rev().take_while(char::is_ascii_digit).collect();
    let guest: String = guest.chars().take_while(char::is_ascii_digit).collect();
    let home: String = home.chars().rev().collect();
    Some((home.parse().ok()?, guest.parse().ok()?))
}

/// `"14:2"` style point columns count the plus points.
fn points_of(text: &str) -> Option<i64> {
    parse_score(text).map(|(plus, _)| plus).or_else(|| last_number(text))
}

fn is_match_row(id: &str) -> bool {
    id.get(..5).is_some_and(|prefix| prefix.eq_ignore_ascii_case("spiel"))
        && id.len() > 5
        && id[5..].chars().all(|c| c.is_ascii_digit())
}

fn matches(document: &Html) -> Result<Vec<MatchRecord>, ExtractionIssue> {
    let rows = selector(ROSTER, "tr[id]")?;
    let cells = selector(ROSTER, "td")?;

    let mut out = Vec::new();
    for tr in document.select(&rows) {
        if !tr.value().attr("id").is_some_and(is_match_row) {
            continue;
        }
        let texts: Vec<String> = tr.select(&cells).map(element_text).collect();
        if texts.len() < 10 {
            continue;
        }
        let score = parse_score(&texts[9]);
        out.push(MatchRecord {
            match_number: text_or_none(texts[1].clone()),
            date: text_or_none(texts[4].clone()),
            time: text_or_none(texts[6].clone()),
            home_team: texts[7].clone(),
            guest_team: texts[8].clone(),
            home_score: score.map(|(home, _)| home),
            guest_score: score.map(|(_, guest)| guest),
            status: if score.is_some() {
                MatchStatus::Completed
            } else {
                MatchStatus::Upcoming
            },
        });
    }
    Ok(out)
}

pub fn parse_roster_page(html: &str) -> Result<RosterPage, ExtractionIssue> {
    let document = Html::parse_document(html);
    let players = players(&document)?;
    let matches = matches(&document)?;
    if players.is_empty() && matches.is_empty() {
        return Err(ExtractionIssue::StructuralParsing {
            resource: ROSTER.to_string(),
            message: "no player rows or match rows found".to_string(),
        });
    }
    Ok(RosterPage { players, matches })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_number_takes_the_final_digit_run() {
        assert_eq!(last_number("LivePZ 1498 (Δ +12) 1510"), Some(1510));
        assert_eq!(last_number("--"), None);
    }

    #[test]
    fn scores_need_digits_on_both_sides() {
        assert_eq!(parse_score("9:3"), Some((9, 3)));
        assert_eq!(parse_score(" 10:12 n.V."), Some((10, 12)));
        assert_eq!(parse_score("-:-"), None);
        assert_eq!(parse_score(""), None);
    }

    #[test]
    fn match_row_ids() {
        assert!(is_match_row("Spiel12"));
        assert!(is_match_row("spiel3"));
        assert!(!is_match_row("Spielplan"));
        assert!(!is_match_row("Spiel"));
    }

    #[test]
    fn standings_fill_in_for_missing_navigation() {
        let html = r#"<table class="tabelle">
            <tr><th>Platz</th><th>Mannschaft</th><th>Punkte</th></tr>
            <tr><td>1.</td><td>TTC Nord 2</td><td>14:2</td></tr>
            <tr><td>2.</td><td>SV Ost</td><td>10:6</td></tr>
        </table>"#;
        let page = parse_ranking_page(html, "Kreisliga Nord").expect("ranking");
        assert_eq!(page.standings.len(), 2);
        assert_eq!(page.standings[0].points, Some(14));
        assert_eq!(page.teams[0].club_name, "TTC Nord");
        assert_eq!(page.teams[0].team_number, 2);
    }

    #[test]
    fn empty_pages_are_structural_errors() {
        assert!(matches!(
            parse_ranking_page("<p>maintenance</p>", "Liga"),
            Err(ExtractionIssue::StructuralParsing { .. })
        ));
        assert!(parse_roster_page("<p>maintenance</p>").is_err());
    }

    #[test]
    fn unstructured_players_pair_by_position() {
        let html = r#"<div><a href="?Spieler=1">Erika Muster</a><a href="?Spieler=2">Max Beispiel</a></div>
            <table><tr><td class="tooltip" title="LivePZ-Wert">1520</td></tr></table>"#;
        let page = parse_roster_page(html).expect("roster");
        assert_eq!(page.players.len(), 2);
        assert_eq!(page.players[0].live_pz, Some(1520));
        assert_eq!(page.players[1].live_pz, None);
    }
}
